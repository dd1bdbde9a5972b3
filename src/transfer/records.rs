use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use sha2::{Digest, Sha256, digest::FixedOutput};

use super::TransferError;
use crate::transit::Transit;

/// Encrypt and send the file as records, return the sha256 of the plaintext
pub(super) async fn send_records<F>(
    transit: &mut Transit,
    file: &mut (impl AsyncRead + Unpin + ?Sized),
    file_size: u64,
    chunk_size: usize,
    mut progress_handler: F,
) -> Result<Vec<u8>, TransferError>
where
    F: FnMut(u64, u64),
{
    // Report at 0 to allow clients to configure as necessary.
    progress_handler(0, file_size);

    let mut hasher = Sha256::default();
    let mut plaintext = vec![0u8; chunk_size];
    let mut sent_size = 0;
    loop {
        /* Fill the whole chunk unless the file ends */
        let mut filled = 0;
        while filled < chunk_size {
            let n = file.read(&mut plaintext[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        sent_size += filled as u64;
        ensure!(sent_size <= file_size, TransferError::FileSize);

        transit.send_record(&plaintext[..filled]).await?;
        hasher.update(&plaintext[..filled]);
        progress_handler(sent_size, file_size);
    }
    transit.flush().await?;

    ensure!(sent_size == file_size, TransferError::FileSize);
    Ok(hasher.finalize_fixed().to_vec())
}

/// Receive exactly `filesize` bytes of records into `content_handler`, return their sha256
///
/// Each record is authenticated on arrival, so nothing unverified is ever written.
pub(super) async fn receive_records<F, W>(
    filesize: u64,
    transit: &mut Transit,
    mut progress_handler: F,
    content_handler: &mut W,
) -> Result<Vec<u8>, TransferError>
where
    F: FnMut(u64, u64),
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::default();
    let mut received = 0u64;

    progress_handler(0, filesize);

    while received < filesize {
        let plaintext = transit.receive_record().await?;
        received += plaintext.len() as u64;
        ensure!(received <= filesize, TransferError::FileSize);

        content_handler.write_all(&plaintext).await?;
        hasher.update(&plaintext);
        progress_handler(received, filesize);
    }
    content_handler.flush().await?;

    tracing::debug!("Received all {} bytes", filesize);
    Ok(hasher.finalize_fixed().to_vec())
}
