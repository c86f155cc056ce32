//! Unix socket server exposing [`ApiService`]
//!
//! Each connection is identified by the uid of its peer (`SO_PEERCRED`).
//! Requests and replies are JSON lines; a `protect_socket` request carries
//! the descriptor to protect as `SCM_RIGHTS` ancillary data. A connection
//! that registers as observer receives `status_update` lines until it
//! unregisters or disconnects.

use std::collections::VecDeque;
use std::io::{self, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::auth::CallerIdentity;
use crate::error::{DeliveryError, Error, Result};
use crate::hub::{ObserverId, StatusObserver};
use crate::protocol::{encode_line, ApiRequest, ApiResponse};
use crate::service::ApiService;
use crate::status::StatusSnapshot;

/// Longest request line accepted
const MAX_LINE: usize = 1 << 20;

/// Descriptors accepted with a single read
const MAX_FDS: usize = 4;

/// Lines queued for one connection before observer pushes block
const OUTBOX_CAPACITY: usize = 64;

/// Control API server
pub struct ApiServer {
    socket_path: PathBuf,
    listener: UnixListener,
    service: Arc<ApiService>,
}

impl ApiServer {
    /// Bind the API socket, replacing a stale one
    pub fn bind(socket_path: impl AsRef<Path>, service: Arc<ApiService>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&socket_path);

        if let Some(parent) = socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::Config(format!("Failed to bind API socket: {}", e)))?;

        // Any local user may connect; requests are checked against the allow-list
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o666);
            let _ = std::fs::set_permissions(&socket_path, perms);
        }

        log::info!("API socket listening on {:?}", socket_path);

        Ok(Self {
            socket_path,
            listener,
            service,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            log::debug!("API connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("API socket accept error: {}", e);
                }
            }
        }
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<ApiService>) -> Result<()> {
    let caller = CallerIdentity::new(stream.peer_cred()?.uid());
    log::debug!("API connection from uid {}", caller.uid);

    let (reader, writer) = stream.into_split();
    let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
    let writer_task = tokio::spawn(write_lines(writer, rx));

    let mut connection = Connection {
        service,
        caller,
        outbox,
        observer: None,
        reader: FrameReader::new(reader),
    };
    let result = connection.serve().await;
    connection.close();

    writer_task.abort();
    result
}

async fn write_lines(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::debug!("Failed to write to API client: {}", e);
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

struct Connection {
    service: Arc<ApiService>,
    caller: CallerIdentity,
    outbox: mpsc::Sender<String>,
    /// Observer handle of this connection, created on first registration
    observer: Option<Arc<SocketObserver>>,
    reader: FrameReader,
}

impl Connection {
    async fn serve(&mut self) -> Result<()> {
        while let Some(line) = self.reader.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<ApiRequest>(line) {
                Ok(request) => {
                    log::debug!("uid {}: {}", self.caller.uid, request.name());
                    self.handle(request)
                        .await
                        .unwrap_or_else(|e| ApiResponse::from_error(&e))
                }
                Err(e) => {
                    ApiResponse::from_error(&Error::Protocol(format!("Invalid request: {}", e)))
                }
            };

            if self.outbox.send(encode_line(&response)?).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn handle(&mut self, request: ApiRequest) -> Result<ApiResponse> {
        let service = &self.service;
        let caller = self.caller;

        let response = match request {
            ApiRequest::ListProfiles => ApiResponse::Profiles {
                profiles: service.list_profiles(caller)?,
            },
            ApiRequest::StartProfile { uuid } => ApiResponse::Intent {
                intent: service.start_profile(caller, uuid).await?,
            },
            ApiRequest::StartInlineConfig { name, config } => ApiResponse::Intent {
                intent: service.start_inline_config(caller, &name, &config).await?,
            },
            ApiRequest::AddProfile { name, config } => ApiResponse::Bool {
                value: service.add_profile(caller, &name, &config)?,
            },
            ApiRequest::AddProfileDetailed {
                name,
                user_editable,
                config,
            } => ApiResponse::Profile {
                profile: service.add_profile_detailed(caller, &name, user_editable, &config)?,
            },
            ApiRequest::RemoveProfile { uuid } => {
                service.remove_profile(caller, uuid)?;
                ApiResponse::Ok
            }
            ApiRequest::ProtectSocket => {
                // Authorize before consuming the descriptor sent with the request
                service.authorize(caller)?;
                let fd = self.reader.take_fd().ok_or_else(|| {
                    Error::Protocol("protect_socket needs a descriptor (SCM_RIGHTS)".into())
                })?;
                ApiResponse::Bool {
                    value: service.protect_socket(caller, fd.as_fd())?,
                }
            }
            ApiRequest::CheckPreApproved { caller_name } => ApiResponse::Intent {
                intent: service.check_pre_approved(&caller_name),
            },
            ApiRequest::CheckTunnelPermission => ApiResponse::Intent {
                intent: service.check_tunnel_permission(caller)?,
            },
            ApiRequest::RegisterObserver => {
                let observer = self
                    .observer
                    .get_or_insert_with(|| {
                        Arc::new(SocketObserver {
                            id: ObserverId::next(),
                            outbox: self.outbox.clone(),
                        })
                    })
                    .clone();
                service.register_observer(caller, observer).await?;
                ApiResponse::Ok
            }
            ApiRequest::UnregisterObserver => {
                // A connection that never registered has no handle; a fresh id matches nothing
                let id = self
                    .observer
                    .as_ref()
                    .map_or_else(ObserverId::next, |observer| observer.id);
                service.unregister_observer(caller, id)?;
                ApiResponse::Ok
            }
            ApiRequest::Status => {
                let (status, connected_or_connecting) = service.status(caller)?;
                ApiResponse::Status {
                    status: (&status).into(),
                    connected_or_connecting,
                }
            }
            ApiRequest::Stop => {
                service.stop(caller).await?;
                ApiResponse::Ok
            }
            ApiRequest::Pause => {
                service.pause(caller).await?;
                ApiResponse::Ok
            }
            ApiRequest::Resume => {
                service.resume(caller).await?;
                ApiResponse::Ok
            }
        };
        Ok(response)
    }

    /// Drop the observer registration of a closed connection
    fn close(&mut self) {
        if let Some(observer) = self.observer.take() {
            if self.service.hub().unregister(observer.id) {
                log::debug!("Removed {} of closed connection", observer.id);
            }
        }
    }
}

/// Observer pushing updates onto a connection
struct SocketObserver {
    id: ObserverId,
    outbox: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl StatusObserver for SocketObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    async fn on_status(&self, status: &StatusSnapshot) -> std::result::Result<(), DeliveryError> {
        let line = encode_line(&ApiResponse::StatusUpdate(status.into()))
            .map_err(|_| DeliveryError::Unreachable)?;
        self.outbox
            .send(line)
            .await
            .map_err(|_| DeliveryError::Unreachable)
    }
}

/// Line reader that also collects descriptors passed with the data
struct FrameReader {
    reader: OwnedReadHalf,
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            fds: VecDeque::new(),
        }
    }

    /// Oldest received descriptor not yet consumed
    fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Next complete line; `None` at end of stream
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
            if self.buf.len() > MAX_LINE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "request line too long"));
            }
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

        let stream: &UnixStream = self.reader.as_ref();
        let fd = stream.as_raw_fd();
        let mut chunk = [0u8; 4096];

        loop {
            stream.readable().await?;

            #[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on some platforms
            let result = stream.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);

                let outcome = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty());
                let msg = match outcome {
                    Ok(msg) => msg,
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {
                        return Err(io::Error::from(io::ErrorKind::WouldBlock));
                    }
                    Err(e) => return Err(io::Error::other(e)),
                };

                let mut received = Vec::new();
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        received.extend(fds);
                    }
                }
                Ok((msg.bytes, received))
            });

            match result {
                Ok((n, received)) => {
                    for raw in received {
                        // SAFETY: SCM_RIGHTS installed a fresh descriptor owned by nobody else
                        self.fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Spurious wakeup, retry
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
