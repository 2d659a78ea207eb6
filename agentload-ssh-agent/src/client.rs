//! Client side of the agent socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::error::AgentError;
use crate::proto::{self, AgentIdentity};

/// Connection parameters for one running agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket: PathBuf,
    timeout: Duration,
}

impl AgentClient {
    /// `timeout` bounds connect, request and response together.
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    /// Like [`new`](Self::new), but fails when no socket is known.
    pub fn from_socket(socket: Option<PathBuf>, timeout: Duration) -> Result<Self, AgentError> {
        socket
            .map(|s| Self::new(s, timeout))
            .ok_or(AgentError::NotConfigured)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self, deadline: Instant) -> Result<UnixStream, AgentError> {
        match timeout_at(deadline, UnixStream::connect(&self.socket)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(AgentError::Connect {
                path: self.socket.clone(),
                source,
            }),
            Err(_) => Err(AgentError::Timeout(self.timeout)),
        }
    }

    /// Register `identity` with the agent.
    ///
    /// The connection is closed before returning, whatever the outcome.
    pub async fn add_identity(&self, identity: &AgentIdentity) -> Result<(), AgentError> {
        self.add_identity_before(identity, Instant::now() + self.timeout)
            .await
    }

    /// Connect and exchange, both within the single `deadline`.
    async fn add_identity_before(
        &self,
        identity: &AgentIdentity,
        deadline: Instant,
    ) -> Result<(), AgentError> {
        let mut stream = self.connect(deadline).await?;
        debug!(socket = %self.socket.display(), "agent: connected");

        let result = timeout_at(deadline, proto::add_identity(&mut stream, identity))
            .await
            .unwrap_or_else(|_| Err(AgentError::Timeout(self.timeout)));

        // The agent may already have hung up.
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "agent: shutdown after exchange failed");
        }
        drop(stream);

        match &result {
            Ok(()) => debug!("agent: identity accepted"),
            Err(e) => debug!(error = %e, "agent: add-identity failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{KeyField, SSH_AGENT_FAILURE, SSH_AGENT_SUCCESS, read_frame};
    use tokio::net::UnixListener;
    use zeroize::Zeroizing;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            key_type: "ssh-rsa".to_string(),
            fields: vec![KeyField::Mpint(Zeroizing::new(vec![1, 2, 3]))],
            comment: "c".to_string(),
            constraints: Vec::new(),
        }
    }

    /// Accept one connection, read one request, answer with `reply`.
    fn spawn_agent(dir: &Path, reply: &'static [u8]) -> PathBuf {
        let path = dir.join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            read_frame(&mut conn).await.unwrap();
            conn.write_all(reply).await.unwrap();
        });
        path
    }

    #[test]
    fn missing_socket_is_not_configured() {
        let err = AgentClient::from_socket(None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AgentError::NotConfigured));
    }

    #[tokio::test]
    async fn adds_identity_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = spawn_agent(dir.path(), &[0, 0, 0, 1, SSH_AGENT_SUCCESS]);

        let client = AgentClient::new(&socket, Duration::from_secs(5));
        client.add_identity(&identity()).await.unwrap();
    }

    #[tokio::test]
    async fn agent_failure_is_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = spawn_agent(dir.path(), &[0, 0, 0, 1, SSH_AGENT_FAILURE]);

        let client = AgentClient::new(&socket, Duration::from_secs(5));
        let err = client.add_identity(&identity()).await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected { reason: None }));
    }

    #[tokio::test]
    async fn nonexistent_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nobody-home.sock");

        let client = AgentClient::new(&socket, Duration::from_secs(5));
        let err = client.add_identity(&identity()).await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { ref path, .. } if *path == socket));
    }

    #[tokio::test]
    async fn silent_agent_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            // Hold the connection open without ever replying.
            std::future::pending::<()>().await;
            drop(conn);
        });

        let client = AgentClient::new(&path, Duration::from_millis(200));
        let err = client.add_identity(&identity()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn connect_and_exchange_share_one_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (_conn, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        // 400ms budget, 300ms of it already spent before connecting.
        let client = AgentClient::new(&path, Duration::from_millis(400));
        let deadline = Instant::now() + Duration::from_millis(400);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        let err = client
            .add_identity_before(&identity(), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)), "{err}");
        // Only the remaining ~100ms is spent, not a fresh 400ms.
        assert!(started.elapsed() < Duration::from_millis(350), "{:?}", started.elapsed());
    }
}
