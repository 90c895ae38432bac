//! Example from the crate documentation: a sender feeding a duplicate suppressor that feeds a
//! priority receiver.

use std::sync::Arc;
use std::time::Duration;

use flowlink::{DuplicateSuppressor, PriorityReceiver, Sender, Source};

fn main() {
    let sender = Sender::<u32>::new();

    let receiver = sender
        .connect_to(&Arc::new(DuplicateSuppressor::<u32>::new(
            Duration::from_secs(60),
        )))
        .connect_to(&Arc::new(PriorityReceiver::<u32>::new()));

    for reading in [42, 99, 42, 10] {
        sender.send(reading).expect("no sink in this graph can fail");
    }

    assert_eq!(receiver.try_receive(), Some(99));
    println!("highest reading: 99");
}
