//! Short-lived SSH connections to managed hosts.
//!
//! The connector is fully blocking (libssh2 plus the sync redis client
//! for output publication) and is always driven from
//! `tokio::task::spawn_blocking`. Commands get a pty so stdout and
//! stderr arrive merged; non-root transport users are wrapped with the
//! escalation primitive and fed the stored sudo password on stdin.

mod probes;

pub use probes::HostUsage;

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};
use ssh2::Session;
use tracing::{debug, warn};
use uuid::Uuid;

use aurora_model::Server;

use crate::error::{CoreError, Result};
use crate::stream::SyncPublisher;

/// Transport coordinates resolved from a [`Server`] row plus the local
/// path of its key file, when one is attached.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<std::path::PathBuf>,
    pub sudo_password: Option<String>,
    pub timeout: Duration,
}

impl ConnectOptions {
    pub fn for_server(
        server: &Server,
        key_path: Option<std::path::PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            user: server.user.clone(),
            password: server.ssh_password.clone(),
            key_path,
            sudo_password: server.sudo_password.clone(),
            timeout,
        }
    }
}

/// Single-quote a command for `sh -c`.
fn shell_quote(cmd: &str) -> String {
    format!("'{}'", cmd.replace('\'', r"'\''"))
}

pub struct HostConnection {
    session: Session,
    sudo: bool,
    sudo_password: Option<String>,
    publisher: Option<SyncPublisher>,
}

impl std::fmt::Debug for HostConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnection")
            .field("sudo", &self.sudo)
            .finish()
    }
}

impl HostConnection {
    /// Connect and authenticate within the per-server timeout. When a
    /// publisher is attached, command output is mirrored onto the job's
    /// stream channel.
    pub fn open(
        options: &ConnectOptions,
        publisher: Option<SyncPublisher>,
    ) -> Result<Self> {
        let addr = (options.host.as_str(), options.port)
            .to_socket_addrs()
            .map_err(|e| {
                CoreError::transport(format!(
                    "cannot resolve {}: {e}",
                    options.host
                ))
            })?
            .next()
            .ok_or_else(|| {
                CoreError::transport(format!(
                    "no address for {}",
                    options.host
                ))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, options.timeout)
            .map_err(|e| {
                CoreError::transport(format!(
                    "connect to {addr} failed: {e}"
                ))
            })?;

        let mut session = Session::new().map_err(|e| {
            CoreError::transport(format!("ssh session init failed: {e}"))
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(options.timeout.as_millis() as u32);
        session.handshake().map_err(|e| {
            CoreError::transport(format!("ssh handshake failed: {e}"))
        })?;

        let mut authed = false;
        if let Some(key_path) = &options.key_path {
            match session.userauth_pubkey_file(
                &options.user,
                None,
                key_path,
                None,
            ) {
                Ok(()) => authed = true,
                Err(e) => {
                    warn!("Key auth failed, falling back to password: {e}")
                }
            }
        }
        if !authed {
            if let Some(password) = &options.password {
                session
                    .userauth_password(&options.user, password)
                    .map_err(|e| {
                        CoreError::transport(format!(
                            "password auth failed: {e}"
                        ))
                    })?;
                authed = true;
            }
        }
        if !authed || !session.authenticated() {
            return Err(CoreError::transport(format!(
                "authentication failed for {}@{}",
                options.user, options.host
            )));
        }

        // Remote commands run to completion; only connect/auth is
        // bounded by the timeout.
        session.set_timeout(0);

        Ok(Self {
            session,
            sudo: options.user != "root",
            sudo_password: options.sudo_password.clone(),
            publisher,
        })
    }

    /// Run a command, publish its merged output, and fail on non-zero
    /// exit.
    pub fn run(&mut self, cmd: &str) -> Result<String> {
        let (status, output) = self.exec(cmd, true)?;
        if status != 0 {
            return Err(CoreError::remote_step(format!(
                "`{cmd}` exited {status}: {output}"
            )));
        }
        Ok(output)
    }

    /// Run a command without publishing or exit-status checking.
    pub fn run_unchecked(&mut self, cmd: &str) -> Result<(i32, String)> {
        self.exec(cmd, false)
    }

    fn exec(&mut self, cmd: &str, publish: bool) -> Result<(i32, String)> {
        let wrapped = if self.sudo {
            format!("sudo -S -p '' sh -c {}", shell_quote(cmd))
        } else {
            cmd.to_string()
        };
        debug!("remote$ {wrapped}");

        let mut channel =
            self.session.channel_session().map_err(|e| {
                CoreError::transport(format!("channel open failed: {e}"))
            })?;
        // A pty merges stderr into stdout for us.
        channel.request_pty("xterm", None, None).map_err(|e| {
            CoreError::transport(format!("pty request failed: {e}"))
        })?;
        channel.exec(&wrapped).map_err(|e| {
            CoreError::transport(format!("exec failed: {e}"))
        })?;

        if self.sudo {
            if let Some(password) = &self.sudo_password {
                channel
                    .write_all(format!("{password}\n").as_bytes())
                    .map_err(|e| {
                        CoreError::transport(format!(
                            "sudo password write failed: {e}"
                        ))
                    })?;
            }
        }

        let mut output = String::new();
        channel.read_to_string(&mut output).map_err(|e| {
            CoreError::transport(format!("read failed: {e}"))
        })?;
        channel.wait_close().map_err(|e| {
            CoreError::transport(format!("channel close failed: {e}"))
        })?;
        let status = channel.exit_status().map_err(|e| {
            CoreError::transport(format!("exit status failed: {e}"))
        })?;

        let output = output.trim().to_string();
        if publish {
            self.publish(&output);
        }
        Ok((status, output))
    }

    fn publish(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(publisher) = &mut self.publisher {
            if let Err(err) = publisher.publish(text) {
                warn!("Stream publish failed: {err}");
            }
        }
    }

    pub fn exists(&mut self, remote: &str) -> Result<bool> {
        let (status, _) =
            self.run_unchecked(&format!("test -e {remote}"))?;
        Ok(status == 0)
    }

    /// Upload a local file unless the destination already matches its
    /// MD5. Returns whether a transfer happened.
    pub fn put_file(
        &mut self,
        local: &Path,
        remote: &str,
        ensure_same: bool,
    ) -> Result<bool> {
        let bytes = std::fs::read(local)?;

        if ensure_same && self.exists(remote)? {
            let local_md5 = format!("{:x}", Md5::digest(&bytes));
            let (status, output) =
                self.run_unchecked(&format!("md5sum {remote}"))?;
            if status == 0 {
                let remote_md5 =
                    output.split_whitespace().next().unwrap_or_default();
                if remote_md5 == local_md5 {
                    debug!("Skipping upload of {remote}, md5 matches");
                    return Ok(false);
                }
            }
        }

        self.upload_bytes(&bytes, remote, None, None)?;
        Ok(true)
    }

    /// Write generated config content atomically: SFTP to a staging path,
    /// then move into place with elevation, optionally chown/chmod.
    pub fn put_content(
        &mut self,
        text: &str,
        remote: &str,
        owner: Option<&str>,
        mode: Option<u32>,
    ) -> Result<()> {
        self.upload_bytes(text.as_bytes(), remote, owner, mode)
    }

    fn upload_bytes(
        &mut self,
        bytes: &[u8],
        remote: &str,
        owner: Option<&str>,
        mode: Option<u32>,
    ) -> Result<()> {
        let staging = format!("/tmp/aurora-{}", Uuid::new_v4());

        let sftp = self.session.sftp().map_err(|e| {
            CoreError::transport(format!("sftp open failed: {e}"))
        })?;
        let mut file =
            sftp.create(Path::new(&staging)).map_err(|e| {
                CoreError::transport(format!(
                    "sftp create {staging} failed: {e}"
                ))
            })?;
        file.write_all(bytes).map_err(|e| {
            CoreError::transport(format!("sftp write failed: {e}"))
        })?;
        drop(file);

        self.run(&format!("mv {staging} {remote}"))?;
        if let Some(mode) = mode {
            self.run(&format!("chmod {mode:o} {remote}"))?;
        }
        if let Some(owner) = owner {
            self.run(&format!("chown {owner} {remote}"))?;
        }
        Ok(())
    }

    pub fn ensure_folder(&mut self, path: &str) -> Result<()> {
        self.run(&format!("mkdir -p {path}"))?;
        Ok(())
    }

    /// Publish the stopword and tear the transport down. Called once per
    /// job so subscribers know the stream is finished.
    pub fn close(mut self) -> Result<()> {
        if let Some(publisher) = &mut self.publisher {
            if let Err(err) = publisher.finish() {
                warn!("Stopword publish failed: {err}");
            }
        }
        self.session
            .disconnect(None, "closing", None)
            .map_err(|e| {
                CoreError::transport(format!("disconnect failed: {e}"))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(
            shell_quote("echo 'hi'"),
            r"'echo '\''hi'\'''"
        );
    }
}
