//! Request/response over the graph: a worker thread answers requests by posting responses to a
//! correlator, and the caller awaits them.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowlink::{RpcCorrelator, RpcError, RpcResponse, Sender, Source};

#[tokio::main]
async fn main() {
    let correlator = Arc::new(RpcCorrelator::<String>::new());
    let responses = Arc::new(Sender::<RpcResponse<String>>::new());
    responses.connect_to(&correlator);

    let answered_id = correlator.next_request_id();
    let answered = correlator
        .register_request(answered_id, Duration::from_secs(5))
        .expect("ids from next_request_id() are unique");

    let forgotten = correlator
        .register_request(correlator.next_request_id(), Duration::from_millis(50))
        .expect("ids from next_request_id() are unique");

    let worker = thread::spawn({
        let responses = Arc::clone(&responses);
        move || {
            thread::sleep(Duration::from_millis(10));
            responses
                .send(RpcResponse::new(answered_id, "pong".to_string()))
                .expect("the correlator accepts every response");
        }
    });

    println!("answered: {:?}", answered.await);
    worker.join().expect("worker thread does not panic");

    tokio::time::sleep(Duration::from_millis(100)).await;
    correlator.sweep_expired();

    assert_eq!(forgotten.await, Err(RpcError::TimedOut));
    println!("forgotten request timed out");
}
