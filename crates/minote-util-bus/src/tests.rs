use super::*;

#[test_log::test(tokio::test)]
async fn every_subscriber_gets_every_item() {
    let tx = Sender::new();
    let mut rx_a = tx.subscribe();
    let mut rx_b = tx.subscribe();

    for i in 0..10u32 {
        assert_eq!(tx.send(i), 2);
    }

    for i in 0..10u32 {
        assert_eq!(rx_a.recv().await, Ok(i));
    }
    for i in 0..10u32 {
        assert_eq!(rx_b.recv().await, Ok(i));
    }
}

#[test_log::test(tokio::test)]
async fn late_subscriber_sees_only_later_items() {
    let tx = Sender::new();
    let mut rx_a = tx.subscribe();

    tx.send(1u32);

    let mut rx_b = tx.subscribe();
    tx.send(2u32);

    assert_eq!(rx_a.recv().await, Ok(1));
    assert_eq!(rx_a.recv().await, Ok(2));
    assert_eq!(rx_b.recv().await, Ok(2));
}

#[test_log::test(tokio::test)]
async fn send_with_no_subscribers_does_not_block() {
    let tx = Sender::new();
    assert_eq!(tx.send(1u32), 0);
}

#[test_log::test(tokio::test)]
async fn closed_after_sender_drop_and_drain() {
    let tx = Sender::new();
    let mut rx = tx.subscribe();

    tx.send(1u32);
    drop(tx);

    assert_eq!(rx.recv().await, Ok(1));
    assert_eq!(rx.recv().await, Err(RecvError::Closed));
}

#[test_log::test(tokio::test)]
async fn dropped_receiver_is_pruned() {
    let tx = Sender::new();
    let rx_a = tx.subscribe();
    let _rx_b = tx.subscribe();
    assert_eq!(tx.receiver_count(), 2);

    drop(rx_a);
    // Pruning happens on the next send.
    assert_eq!(tx.send(1u32), 1);
    assert_eq!(tx.receiver_count(), 1);
}

#[test_log::test(tokio::test)]
async fn recv_wakes_on_send() {
    let tx = Sender::new();
    let mut rx = tx.subscribe();

    let waiter = tokio::spawn(async move { rx.recv().await });
    tokio::task::yield_now().await;

    tx.send(7u32);
    assert_eq!(waiter.await.expect("Task panic"), Ok(7));
}
