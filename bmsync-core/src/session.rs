use tracing::warn;

use crate::backend::{Backend, EditSession, OpenSessionError};
use crate::error::SyncError;

/// An open [`EditSession`] that is closed on every exit path of a write pass.
///
/// Use [`ScopedSession::finish`] to close it and merge the close result with
/// the result of the work done inside it. If the value is dropped instead
/// (panic, cancelled future) the inner session's own drop releases the lock.
pub struct ScopedSession {
    inner: Option<Box<dyn EditSession>>,
}

impl ScopedSession {
    pub async fn open(backend: &dyn Backend) -> Result<Self, OpenSessionError> {
        let inner = backend.open_edit_session().await?;
        Ok(Self { inner: Some(inner) })
    }

    pub fn from_session(inner: Box<dyn EditSession>) -> Self {
        Self { inner: Some(inner) }
    }

    pub async fn put(&mut self, name: &str, bytes: &[u8], checksum: &str) -> Result<(), SyncError> {
        self.session()?.put(name, bytes, checksum).await
    }

    pub async fn delete(&mut self, name: &str) -> Result<(), SyncError> {
        self.session()?.delete(name).await
    }

    pub async fn keep_alive(&mut self) -> Result<(), SyncError> {
        self.session()?.keep_alive().await
    }

    /// Closes the session. A failure of the work itself wins over a close failure.
    pub async fn finish<T>(mut self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        let closed = match self.inner.take() {
            Some(mut inner) => inner.close().await,
            None => Ok(()),
        };
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "failed to close edit session after pass failure");
                Err(err)
            }
        }
    }

    fn session(&mut self) -> Result<&mut Box<dyn EditSession>, SyncError> {
        self.inner
            .as_mut()
            .ok_or_else(|| SyncError::unexpected("edit session already closed"))
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!("edit session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        puts: Vec<String>,
        closed: usize,
        fail_close: bool,
    }

    struct RecordingSession(Arc<Mutex<Calls>>);

    #[async_trait]
    impl EditSession for RecordingSession {
        async fn put(&mut self, name: &str, _bytes: &[u8], _checksum: &str) -> Result<(), SyncError> {
            self.0.lock().unwrap().puts.push(name.to_string());
            Ok(())
        }

        async fn delete(&mut self, _name: &str) -> Result<(), SyncError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SyncError> {
            let mut calls = self.0.lock().unwrap();
            calls.closed += 1;
            if calls.fail_close {
                return Err(SyncError::network("close failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn finish_closes_after_success() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut session = ScopedSession::from_session(Box::new(RecordingSession(calls.clone())));
        session.put("a.kml", b"x", "c").await.unwrap();
        let value = session.finish(Ok(7)).await.unwrap();

        assert_eq!(value, 7);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.puts, vec!["a.kml".to_string()]);
        assert_eq!(calls.closed, 1);
    }

    #[tokio::test]
    async fn finish_closes_after_failure_and_keeps_original_error() {
        let calls = Arc::new(Mutex::new(Calls {
            fail_close: true,
            ..Calls::default()
        }));
        let session = ScopedSession::from_session(Box::new(RecordingSession(calls.clone())));
        let err = session
            .finish::<()>(Err(SyncError::unexpected("boom")))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert_eq!(calls.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn close_failure_is_reported_after_success() {
        let calls = Arc::new(Mutex::new(Calls {
            fail_close: true,
            ..Calls::default()
        }));
        let session = ScopedSession::from_session(Box::new(RecordingSession(calls)));
        let err = session.finish(Ok(())).await.unwrap_err();
        assert!(err.to_string().contains("close failed"));
    }
}
