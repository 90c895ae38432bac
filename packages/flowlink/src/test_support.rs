//! Lets tests use a [`Recorder`] as a sink that logs everything posted to it.

use futures::future::BoxFuture;
use testing::Recorder;

use crate::{Result, Sink};

impl<T> Sink<T> for Recorder<T>
where
    T: Send + Sync,
{
    fn post(&self, message: T) -> Result<()> {
        self.record(message);
        Ok(())
    }

    fn post_async(&self, message: T) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(message);
            Ok(())
        })
    }
}
