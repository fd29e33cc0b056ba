//! Throttled cipher pipelines for file bodies.
//!
//! Sending: file → [`ContentCipher`] → [`Throttle`] → data channel, with the
//! authentication tag written last. Receiving: data channel →
//! [`ContentDecipher`] → output. Any stage failing aborts the whole pipeline.

use crate::session::{ContentCipher, ContentDecipher};
use crate::utils::Result;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Caps throughput at `chunk_size` bytes per `period`
#[derive(Debug)]
pub struct Throttle {
    chunk_size: usize,
    ticker: Interval,
}

impl Throttle {
    /// Create a throttle; the first chunk may go immediately
    pub fn new(chunk_size: usize, period: Duration) -> Self {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            chunk_size: chunk_size.max(1),
            ticker,
        }
    }

    /// Largest chunk released per period
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Wait until the next chunk may be released
    pub async fn ready(&mut self) {
        self.ticker.tick().await;
    }
}

/// Encrypt `reader` into `writer` at the throttle's pace. Returns the number
/// of content bytes sent.
pub async fn send_stream<R, W>(
    mut reader: R,
    mut cipher: ContentCipher,
    mut writer: W,
    throttle: &mut Throttle,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; throttle.chunk_size()];
    let mut total = 0u64;

    loop {
        let n = read_chunk(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.update(&mut buf[..n])?;
        throttle.ready().await;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.write_all(&cipher.finalize()).await?;
    writer.shutdown().await?;
    debug!("Streamed {total} bytes");
    Ok(total)
}

/// Decrypt `reader` into `writer` and verify the trailing tag. Returns the
/// number of plaintext bytes written.
pub async fn receive_stream<R, W>(
    mut reader: R,
    mut decipher: ContentDecipher,
    mut writer: W,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let plain = decipher.update(&buf[..n])?;
        writer.write_all(&plain).await?;
        total += plain.len() as u64;
    }

    decipher.finalize()?;
    writer.flush().await?;
    Ok(total)
}

/// Fill `buf` unless the reader ends first
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageKeys;
    use tokio::time::Instant;

    fn keys() -> MessageKeys {
        MessageKeys {
            encrypt_key: [3; 32],
            mac_key: [4; 32],
            iv: [5; 32],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_paces_chunks() {
        let data = vec![1u8; 4 * 1024];
        let mut throttle = Throttle::new(1024, Duration::from_millis(50));
        let cipher = ContentCipher::new(&keys()).unwrap();
        let mut out = Vec::new();

        let start = Instant::now();
        let sent = send_stream(&data[..], cipher, &mut out, &mut throttle)
            .await
            .unwrap();

        assert_eq!(sent, 4096);
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(out.len(), 4096 + crate::session::TAG_LEN);
    }

    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut throttle = Throttle::new(16 * 1024, Duration::from_millis(1));
        let (writer, reader) = tokio::io::duplex(4096);

        let send = send_stream(
            &data[..],
            ContentCipher::new(&keys()).unwrap(),
            writer,
            &mut throttle,
        );
        let mut out = Vec::new();
        let receive = receive_stream(reader, ContentDecipher::new(&keys()).unwrap(), &mut out);

        let (sent, received) = tokio::join!(send, receive);
        assert_eq!(sent.unwrap(), data.len() as u64);
        assert_eq!(received.unwrap(), data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_tampered_pipeline_fails() {
        let mut sealed = Vec::new();
        let mut throttle = Throttle::new(8, Duration::from_millis(1));
        send_stream(
            &b"attack at dawn"[..],
            ContentCipher::new(&keys()).unwrap(),
            &mut sealed,
            &mut throttle,
        )
        .await
        .unwrap();
        sealed[0] ^= 1;

        let mut out = Vec::new();
        let result = receive_stream(&sealed[..], ContentDecipher::new(&keys()).unwrap(), &mut out).await;
        assert!(result.is_err());
    }
}
