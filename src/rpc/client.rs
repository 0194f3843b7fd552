//! Client side of a peer agent connection.

use std::time::{Duration, Instant};

use tonic::metadata::MetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::Channel;
use tonic::Request;

use crate::error::{Error, Result};
use crate::rpc::proto::agent_client::AgentClient as ProtoClient;
use crate::rpc::proto::{
    AgentShutdownRequest, CommandArgs, CurrentTimeRequest, Message, PeerJoinRequest,
    PeerLeaveRequest, RuntimeConfig, RuntimeConfigRequest, SystemInfo, SystemInfoRequest,
};
use crate::rpc::{Credentials, TOKEN_METADATA_KEY};

/// Reconnect parameters: base 1s, factor 1.5, cap 10s, max elapsed 5 min.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_FACTOR: f64 = 1.5;
pub const BACKOFF_CAP: Duration = Duration::from_secs(10);
pub const BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(300);

/// Exponential backoff schedule.
pub struct Backoff {
    current: Duration,
    factor: f64,
    cap: Duration,
    deadline: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration, max_elapsed: Duration) -> Backoff {
        Backoff {
            current: base,
            factor,
            cap,
            deadline: Some(Instant::now() + max_elapsed),
        }
    }

    /// The default reconnect schedule.
    pub fn reconnect() -> Backoff {
        Backoff::new(BACKOFF_BASE, BACKOFF_FACTOR, BACKOFF_CAP, BACKOFF_MAX_ELAPSED)
    }

    /// A schedule that never gives up. Used by the peer connect loop.
    pub fn unlimited() -> Backoff {
        Backoff {
            current: BACKOFF_BASE,
            factor: BACKOFF_FACTOR,
            cap: BACKOFF_CAP,
            deadline: None,
        }
    }

    /// Next delay, or `None` once the elapsed cap is exceeded.
    pub fn next(&mut self) -> Option<Duration> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return None;
            }
        }
        let delay = self.current;
        self.current = std::cmp::min(self.current.mul_f64(self.factor), self.cap);
        Some(delay)
    }
}

/// Attaches the shared token to every outgoing request.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: MetadataValue<tonic::metadata::Ascii>,
}

impl AuthInterceptor {
    pub fn new(credentials: &Credentials) -> Result<AuthInterceptor> {
        let token = credentials
            .token
            .parse()
            .map_err(|_| Error::invalid_argument("token is not valid metadata"))?;
        Ok(AuthInterceptor { token })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, tonic::Status> {
        request
            .metadata_mut()
            .insert(TOKEN_METADATA_KEY, self.token.clone());
        Ok(request)
    }
}

/// gRPC client for a single peer agent.
pub struct AgentClient {
    client: ProtoClient<InterceptedService<Channel, AuthInterceptor>>,
}

impl AgentClient {
    /// Connect to the agent at the specified address.
    pub async fn connect(addr: &str, credentials: &Credentials) -> Result<AgentClient> {
        let endpoint = Channel::from_shared(format!("http://{}", addr))
            .map_err(|err| Error::invalid_argument(format!("bad agent address: {}", err)))?
            .connect_timeout(Duration::from_secs(5));
        let channel = endpoint.connect().await?;
        let interceptor = AuthInterceptor::new(credentials)?;
        Ok(AgentClient {
            client: ProtoClient::with_interceptor(channel, interceptor),
        })
    }

    /// Connect, retrying transient failures on the given schedule.
    pub async fn connect_with_backoff(
        addr: &str,
        credentials: &Credentials,
        mut backoff: Backoff,
    ) -> Result<AgentClient> {
        loop {
            match AgentClient::connect(addr, credentials).await {
                Ok(client) => return Ok(client),
                Err(err) => match backoff.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(Error::connection_problem(format!(
                            "failed to connect to agent {}: {}",
                            addr, err
                        )))
                    }
                },
            }
        }
    }

    /// Execute a command on the agent; the response stream carries output
    /// lines and the final status.
    pub async fn command(
        &mut self,
        args: Vec<String>,
        self_command: bool,
    ) -> Result<tonic::Streaming<Message>> {
        let response = self
            .client
            .command(CommandArgs { args, self_command })
            .await?;
        Ok(response.into_inner())
    }

    pub async fn peer_join(&mut self, request: PeerJoinRequest) -> Result<()> {
        self.client.peer_join(request).await?;
        Ok(())
    }

    pub async fn peer_leave(&mut self, request: PeerLeaveRequest) -> Result<()> {
        self.client.peer_leave(request).await?;
        Ok(())
    }

    pub async fn get_system_info(&mut self) -> Result<SystemInfo> {
        let response = self.client.get_system_info(SystemInfoRequest {}).await?;
        Ok(response.into_inner())
    }

    pub async fn get_runtime_config(&mut self) -> Result<RuntimeConfig> {
        let response = self
            .client
            .get_runtime_config(RuntimeConfigRequest {})
            .await?;
        Ok(response.into_inner())
    }

    pub async fn get_current_time(&mut self) -> Result<i64> {
        let response = self.client.get_current_time(CurrentTimeRequest {}).await?;
        Ok(response.into_inner().unix_millis)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.client.shutdown(AgentShutdownRequest {}).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            1.5,
            Duration::from_secs(10),
            Duration::from_secs(300),
        );
        assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(1500)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(2250)));
        // Eventually capped.
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next().unwrap();
        }
        assert_eq!(last, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_elapsed_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            1.5,
            Duration::from_secs(10),
            Duration::ZERO,
        );
        assert_eq!(backoff.next(), None);
    }
}
