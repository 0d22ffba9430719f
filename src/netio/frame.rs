use super::{NetworkIo, Shaping, TransportError};
use crate::conn::{Connection, Link};
use crate::mse::Cipher;
use crate::sched::{self, Priority, Scheduler};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Max length of a message body, larger messages are a protocol violation.
pub const MAX_MESSAGE_LENGTH: usize = 128 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("protocol violation: message length {0}")]
    ProtocolViolation(i64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Scheduler(#[from] sched::Error),
}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::ProtocolViolation(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            FrameError::Transport(e) => e.into(),
            FrameError::Scheduler(e) => e.into(),
        }
    }
}

impl NetworkIo {
    /// Send `payload` prefixed with its big-endian length, both encrypted with `encryptor`.
    pub async fn send_frame<C: Connection>(
        &self,
        link: &Link<C>,
        encryptor: &mut Cipher,
        payload: &[u8],
        shaping: Shaping<'_>,
    ) -> Result<(), FrameError> {
        if payload.len() > MAX_MESSAGE_LENGTH {
            return Err(FrameError::ProtocolViolation(payload.len() as i64));
        }
        let length = payload.len() as u32;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(payload);
        encryptor.apply(&mut frame);
        self.send(link, &frame, shaping).await?;
        Ok(())
    }

    /// Receive one length-prefixed message and decrypt it with `decryptor`.
    /// Returns `None` for a keep-alive. The connection is closed if the length is invalid.
    pub async fn receive_frame<C: Connection>(
        &self,
        link: &Link<C>,
        decryptor: &mut Cipher,
        shaping: Shaping<'_>,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.receive(link, &mut prefix, shaping).await?;
        decryptor.apply(&mut prefix);

        let length = i32::from_be_bytes(prefix);
        if length < 0 || length as usize > MAX_MESSAGE_LENGTH {
            log::warn!("{} => invalid message length {length}", link.connection().uri());
            link.connection().close();
            return Err(FrameError::ProtocolViolation(length.into()));
        }
        if length == 0 {
            return Ok(None);
        }
        let mut body = vec![0u8; length as usize];
        self.receive(link, &mut body, shaping).await?;
        decryptor.apply(&mut body);
        Ok(Some(body))
    }

    /// Receive messages until an error occurs, and submit each of them to `scheduler`
    /// for processing by `handler`. Keep-alives are skipped. Returns the terminal error.
    pub async fn receive_messages<C, F>(
        &self,
        link: &Link<C>,
        decryptor: &mut Cipher,
        shaping: Shaping<'_>,
        scheduler: &Scheduler,
        handler: F,
    ) -> FrameError
    where
        C: Connection,
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let body = match self.receive_frame(link, decryptor, shaping).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    log::trace!("{} => keep-alive", link.connection().uri());
                    continue;
                }
                Err(e) => return e,
            };
            let handler = handler.clone();
            if let Err(e) = scheduler.submit(Priority::Normal, move || handler(body)) {
                return e.into();
            }
        }
    }
}
