//! Client side of the API socket

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::profile::ProfileRef;
use crate::protocol::{encode_line, ApiRequest, ApiResponse, Intent, StatusUpdate};

/// How long to wait for a reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a running API server
pub struct ApiClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Status pushes read while waiting for a reply
    pending: VecDeque<StatusUpdate>,
}

impl ApiClient {
    /// Connect to the API socket at `socket_path`
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            Error::Config(format!(
                "Failed to connect to API socket at {:?}: {}. Is hop-apid running?",
                socket_path, e
            ))
        })?;

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            pending: VecDeque::new(),
        })
    }

    /// Send a request and wait for its reply
    ///
    /// `error` replies are turned into [`Error`]s.
    pub async fn request(&mut self, request: &ApiRequest) -> Result<ApiResponse> {
        let line = encode_line(request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<ApiResponse> {
        loop {
            let response = tokio::time::timeout(REPLY_TIMEOUT, self.read_message())
                .await
                .map_err(|_| Error::Protocol("Timeout waiting for response".into()))??;

            match response {
                ApiResponse::StatusUpdate(update) => self.pending.push_back(update),
                other => return other.into_result(),
            }
        }
    }

    async fn read_message(&mut self) -> Result<ApiResponse> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(Error::Protocol("Connection closed by server".into()));
        }
        serde_json::from_str(line.trim())
            .map_err(|e| Error::Protocol(format!("Invalid response: {}", e)))
    }

    /// Next status push; waits until one arrives
    pub async fn next_update(&mut self) -> Result<StatusUpdate> {
        if let Some(update) = self.pending.pop_front() {
            return Ok(update);
        }
        loop {
            match self.read_message().await? {
                ApiResponse::StatusUpdate(update) => return Ok(update),
                other => log::debug!("Ignoring unsolicited reply {:?}", other),
            }
        }
    }

    /// Stored profiles, sorted by name
    pub async fn list_profiles(&mut self) -> Result<Vec<ProfileRef>> {
        match self.request(&ApiRequest::ListProfiles).await? {
            ApiResponse::Profiles { profiles } => Ok(profiles),
            other => Err(unexpected(other)),
        }
    }

    /// Import `config` as an editable profile; `false` if it was rejected
    pub async fn add_profile(&mut self, name: &str, config: &str) -> Result<bool> {
        let request = ApiRequest::AddProfile {
            name: name.to_string(),
            config: config.to_string(),
        };
        match self.request(&request).await? {
            ApiResponse::Bool { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Import `config` as a profile and return it; `None` if it was rejected
    pub async fn add_profile_detailed(
        &mut self,
        name: &str,
        user_editable: bool,
        config: &str,
    ) -> Result<Option<ProfileRef>> {
        let request = ApiRequest::AddProfileDetailed {
            name: name.to_string(),
            user_editable,
            config: config.to_string(),
        };
        match self.request(&request).await? {
            ApiResponse::Profile { profile } => Ok(profile),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a profile; unknown ids are ignored
    pub async fn remove_profile(&mut self, uuid: Uuid) -> Result<()> {
        self.expect_ok(&ApiRequest::RemoveProfile { uuid }).await
    }

    /// Start a stored profile
    ///
    /// Returns the interaction the user has to complete first, if any.
    pub async fn start_profile(&mut self, uuid: Uuid) -> Result<Option<Intent>> {
        self.expect_intent(&ApiRequest::StartProfile { uuid }).await
    }

    /// Start `config` without storing it
    pub async fn start_inline_config(
        &mut self,
        name: &str,
        config: &str,
    ) -> Result<Option<Intent>> {
        let request = ApiRequest::StartInlineConfig {
            name: name.to_string(),
            config: config.to_string(),
        };
        self.expect_intent(&request).await
    }

    /// Ask the server to exempt `fd` from tunnel routing
    pub async fn protect_socket(&mut self, fd: BorrowedFd<'_>) -> Result<bool> {
        let line = encode_line(&ApiRequest::ProtectSocket)?;
        self.send_with_fd(line.as_bytes(), fd).await?;
        match self.read_reply().await? {
            ApiResponse::Bool { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn send_with_fd(&self, data: &[u8], fd: BorrowedFd<'_>) -> Result<()> {
        use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

        let stream: &UnixStream = self.writer.as_ref();
        let socket = stream.as_raw_fd();
        let fds = [fd.as_raw_fd()];
        let mut sent = 0;

        while sent < data.len() {
            stream.writable().await?;

            // The descriptor travels with the first byte only
            let cmsg_rights = [ControlMessage::ScmRights(&fds)];
            let cmsgs: &[ControlMessage<'_>] = if sent == 0 { &cmsg_rights } else { &[] };
            let iov = [IoSlice::new(&data[sent..])];

            #[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on some platforms
            let result = stream.try_io(Interest::WRITABLE, || {
                match sendmsg::<()>(socket, &iov, cmsgs, MsgFlags::empty(), None) {
                    Ok(n) => Ok(n),
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {
                        Err(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                    Err(e) => Err(io::Error::other(e)),
                }
            });

            match result {
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Consent flow needed before `caller_name` may use the API
    pub async fn check_pre_approved(&mut self, caller_name: &str) -> Result<Option<Intent>> {
        let request = ApiRequest::CheckPreApproved {
            caller_name: caller_name.to_string(),
        };
        self.expect_intent(&request).await
    }

    /// Grant flow needed before the daemon may open tunnels, if any
    pub async fn check_tunnel_permission(&mut self) -> Result<Option<Intent>> {
        self.expect_intent(&ApiRequest::CheckTunnelPermission).await
    }

    /// Subscribe this connection to status pushes
    ///
    /// The current status is queued for [`ApiClient::next_update`].
    pub async fn register_observer(&mut self) -> Result<()> {
        self.expect_ok(&ApiRequest::RegisterObserver).await
    }

    /// Stop status pushes to this connection
    pub async fn unregister_observer(&mut self) -> Result<()> {
        self.expect_ok(&ApiRequest::UnregisterObserver).await
    }

    /// Current status and whether it counts as connected or connecting
    pub async fn status(&mut self) -> Result<(StatusUpdate, bool)> {
        match self.request(&ApiRequest::Status).await? {
            ApiResponse::Status {
                status,
                connected_or_connecting,
            } => Ok((status, connected_or_connecting)),
            other => Err(unexpected(other)),
        }
    }

    /// Stop the tunnel
    pub async fn stop(&mut self) -> Result<()> {
        self.expect_ok(&ApiRequest::Stop).await
    }

    /// Pause the tunnel
    pub async fn pause(&mut self) -> Result<()> {
        self.expect_ok(&ApiRequest::Pause).await
    }

    /// Resume a paused tunnel
    pub async fn resume(&mut self) -> Result<()> {
        self.expect_ok(&ApiRequest::Resume).await
    }

    async fn expect_ok(&mut self, request: &ApiRequest) -> Result<()> {
        match self.request(request).await? {
            ApiResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn expect_intent(&mut self, request: &ApiRequest) -> Result<Option<Intent>> {
        match self.request(request).await? {
            ApiResponse::Intent { intent } => Ok(intent),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: ApiResponse) -> Error {
    Error::Protocol(format!("Unexpected response: {:?}", response))
}
