use super::*;

fn row(n: i64) -> Row {
    Row::builder().field("n", n).build()
}

fn ns(buf: &RowBuffer) -> Vec<i64> {
    buf.iter()
        .map(|r| match r.row().get("n") {
            Some(crate::row::Value::Integer(n)) => *n,
            other => panic!("unexpected value: {other:?}"),
        })
        .collect()
}

#[test]
fn push_returns_new_length() {
    let mut buf = RowBuffer::new();
    assert_eq!(buf.push_rows([row(1), row(2)]), 2);
    assert_eq!(buf.push_rows([row(3)]), 3);
    assert_eq!(ns(&buf), vec![1, 2, 3]);
}

#[test]
fn take_batch_is_fifo_and_bounded() {
    let mut buf = RowBuffer::new();
    buf.push_rows((1..=5).map(row));
    let batch = buf.take_batch(2);
    assert_eq!(batch.len(), 2);
    assert_eq!(ns(&buf), vec![3, 4, 5]);
}

#[test]
fn take_batch_caps_at_queue_length() {
    let mut buf = RowBuffer::new();
    buf.push_rows([row(1)]);
    assert_eq!(buf.take_batch(10).len(), 1);
    assert!(buf.is_empty());
    assert!(buf.take_batch(10).is_empty());
}

#[test]
fn prepend_preserves_order() {
    let mut buf = RowBuffer::new();
    buf.push_rows((1..=4).map(row));
    let failed = buf.take_batch(2);
    buf.push_rows([row(5)]);

    buf.prepend(failed);

    assert_eq!(ns(&buf), vec![1, 2, 3, 4, 5]);
}

#[test]
fn prepend_keeps_tokens() {
    let mut buf = RowBuffer::new();
    buf.push_rows([row(1), row(2)]);
    let before: Vec<String> = buf.iter().map(|r| r.insert_id().to_owned()).collect();

    let batch = buf.take_batch(2);
    buf.prepend(batch);

    let after: Vec<String> = buf.iter().map(|r| r.insert_id().to_owned()).collect();
    assert_eq!(before, after);
}

#[test]
fn prepend_empty_is_noop() {
    let mut buf = RowBuffer::new();
    buf.push_rows([row(1)]);
    buf.prepend(Vec::new());
    assert_eq!(ns(&buf), vec![1]);
}
