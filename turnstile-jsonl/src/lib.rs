//! JSONL audit sink for `turnstile`. Writes one record per line.
//! Always appends; bring your own path.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use turnstile::audit::{AuditError, AuditRecord, AuditSink};

/// Append-only audit file, one JSON object per line.
///
/// Appends are serialized so concurrent records never interleave. Clones
/// share the same file and write lock.
#[derive(Clone, Debug)]
pub struct JsonlAuditSink {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlAuditSink {
    /// Sink appending to `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Arc::new(path.into()), write_lock: Arc::new(Mutex::new(())) }
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &AuditRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(invalid_data)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_ref())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record back, oldest first. A missing file is empty.
    pub async fn read_all(&self) -> io::Result<Vec<AuditRecord>> {
        let contents = match tokio::fs::read_to_string(self.path.as_ref()).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(invalid_data))
            .collect()
    }
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.append(&record).await.map_err(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "audit append failed");
            AuditError(format!("{}: {e}", self.path.display()))
        })
    }
}

impl tower_service::Service<AuditRecord> for JsonlAuditSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: AuditRecord) -> Self::Future {
        let sink = self.clone();
        Box::pin(async move { sink.append(&record).await })
    }
}
