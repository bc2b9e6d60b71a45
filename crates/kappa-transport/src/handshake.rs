//! The challenge handshake run inside TLS before a session starts.
//!
//! ```text
//! server                          client
//!   ── Hello(nonce) ────────────────▶
//!   ◀──────────────── AuthRequest ──   (repeat up to MAX_AUTH_ATTEMPTS)
//!   ── AuthSuccess | AuthFailure ───▶
//! ```

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::auth::{AuthRequest, Authenticators, ConnMetadata, Credential, NONCE_LEN, Permissions};
use crate::client::ClientAuth;
use crate::error::{TransportError, TransportResult};
use crate::wire::{Frame, FrameCodec, FrameKind};

/// Attempts a client gets before the server hangs up.
pub const MAX_AUTH_ATTEMPTS: usize = 6;

/// Outcome of a successful server-side handshake.
#[derive(Debug, Clone)]
pub(crate) struct Authenticated {
    pub user: String,
    pub permissions: Permissions,
}

pub(crate) async fn server_handshake<S>(
    framed: &mut Framed<S, FrameCodec>,
    authenticators: &Authenticators,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
) -> TransportResult<Authenticated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    framed
        .send(Frame::new(FrameKind::Hello, 0, Bytes::copy_from_slice(&nonce)))
        .await?;

    for attempt in 1..=MAX_AUTH_ATTEMPTS {
        let frame = next_frame(framed).await?;
        if frame.kind != FrameKind::AuthRequest {
            return Err(TransportError::Protocol(format!(
                "expected AuthRequest, got {:?}",
                frame.kind
            )));
        }
        let request: AuthRequest = serde_json::from_slice(&frame.payload)
            .map_err(|e| TransportError::Handshake(format!("malformed auth request: {e}")))?;

        let meta = ConnMetadata {
            user: request.user.clone(),
            remote_addr,
            local_addr,
        };
        match authenticators.authenticate(&meta, &request.credential, &nonce) {
            Ok(permissions) => {
                framed.send(Frame::control(FrameKind::AuthSuccess)).await?;
                return Ok(Authenticated {
                    user: request.user,
                    permissions,
                });
            }
            Err(err) => {
                debug!(%remote_addr, user = %request.user, attempt, error = %err, "authentication attempt failed");
                framed
                    .send(Frame::new(FrameKind::AuthFailure, 0, err.to_string()))
                    .await?;
            }
        }
    }

    Err(TransportError::AuthenticationFailed(format!(
        "{MAX_AUTH_ATTEMPTS} failed attempts"
    )))
}

pub(crate) async fn client_handshake<S>(
    framed: &mut Framed<S, FrameCodec>,
    user: &str,
    auth: &ClientAuth,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = next_frame(framed).await?;
    if hello.kind != FrameKind::Hello || hello.payload.len() != NONCE_LEN {
        return Err(TransportError::Protocol("expected Hello with nonce".into()));
    }

    let credential = match auth {
        ClientAuth::PublicKey(key) => Credential::sign(key, &hello.payload, user),
        ClientAuth::Password(password) => Credential::Password {
            password: password.clone(),
        },
    };
    let request = AuthRequest {
        user: user.to_string(),
        credential,
    };
    let body = serde_json::to_vec(&request)
        .map_err(|e| TransportError::Handshake(format!("encode auth request: {e}")))?;
    framed
        .send(Frame::new(FrameKind::AuthRequest, 0, body))
        .await?;

    let reply = next_frame(framed).await?;
    match reply.kind {
        FrameKind::AuthSuccess => Ok(()),
        FrameKind::AuthFailure => Err(TransportError::AuthenticationFailed(
            String::from_utf8_lossy(&reply.payload).into_owned(),
        )),
        other => Err(TransportError::Protocol(format!(
            "expected auth reply, got {other:?}"
        ))),
    }
}

async fn next_frame<S>(framed: &mut Framed<S, FrameCodec>) -> TransportResult<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => Ok(frame?),
        None => Err(TransportError::Handshake(
            "peer closed the connection during authentication".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::error::AuthError;
    use ed25519_dalek::{SigningKey, VerifyingKey};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:9022".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn public_key_handshake_succeeds() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let expected = key.verifying_key();
        let auths = Authenticators::new().with_public_key(
            move |meta: &ConnMetadata, k: &VerifyingKey| {
                if *k == expected {
                    Ok(Permissions::new().with_extension("username", meta.user.clone()))
                } else {
                    Err(AuthError::Denied("unknown key".into()))
                }
            },
        );

        let (a, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let mut framed = Framed::new(b, FrameCodec);
            let (remote, local) = addrs();
            server_handshake(&mut framed, &auths, remote, local).await
        });

        let mut client = Framed::new(a, FrameCodec);
        client_handshake(&mut client, "admin", &ClientAuth::PublicKey(key))
            .await
            .unwrap();

        let authed = server.await.unwrap().unwrap();
        assert_eq!(authed.user, "admin");
        assert_eq!(authed.permissions.extension("username"), Some("admin"));
    }

    #[tokio::test]
    async fn wrong_password_fails_on_client() {
        let auths = Authenticators::new()
            .with_password(|_: &ConnMetadata, pw: &str| {
                if pw == "right" {
                    Ok(Permissions::new())
                } else {
                    Err(AuthError::InvalidCredentials)
                }
            });

        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut framed = Framed::new(b, FrameCodec);
            let (remote, local) = addrs();
            let _ = server_handshake(&mut framed, &auths, remote, local).await;
        });

        let mut client = Framed::new(a, FrameCodec);
        let err = client_handshake(&mut client, "admin", &ClientAuth::Password("wrong".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AuthenticationFailed(msg) if msg.contains("invalid credentials")));
    }

    #[tokio::test]
    async fn server_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let auths = Authenticators::new()
            .with_password(|_: &ConnMetadata, _: &str| -> Result<Permissions, AuthError> {
                Err(AuthError::InvalidCredentials)
            })
            .with_auth_log(Arc::new(
                move |_: &ConnMetadata, method: AuthMethod, _: Option<&AuthError>| {
                    assert_eq!(method, AuthMethod::Password);
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut framed = Framed::new(b, FrameCodec);
            let (remote, local) = addrs();
            server_handshake(&mut framed, &auths, remote, local).await
        });

        let mut client = Framed::new(a, FrameCodec);
        let hello = client.next().await.unwrap().unwrap();
        assert_eq!(hello.kind, FrameKind::Hello);
        let body = serde_json::to_vec(&AuthRequest {
            user: "admin".into(),
            credential: Credential::Password {
                password: "guess".into(),
            },
        })
        .unwrap();
        for _ in 0..MAX_AUTH_ATTEMPTS {
            client
                .send(Frame::new(FrameKind::AuthRequest, 0, body.clone()))
                .await
                .unwrap();
            let reply = client.next().await.unwrap().unwrap();
            assert_eq!(reply.kind, FrameKind::AuthFailure);
        }

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::AuthenticationFailed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_AUTH_ATTEMPTS);
    }

    #[tokio::test]
    async fn client_hanging_up_is_a_handshake_error() {
        let auths = Authenticators::new()
            .with_password(|_: &ConnMetadata, _: &str| -> Result<Permissions, AuthError> {
                Ok(Permissions::new())
            });
        let (a, b) = tokio::io::duplex(4096);
        drop(a);

        let mut framed = Framed::new(b, FrameCodec);
        let (remote, local) = addrs();
        let err = server_handshake(&mut framed, &auths, remote, local)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_) | TransportError::Io(_)));
    }
}
