//! Outbound fetch streamed straight into a scratch file.

use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::debug;
use url::Url;

use super::scratch::ScratchFile;

/// Why a fetch did not produce a complete scratch artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FetchFailure {
    /// The request could not be sent or the body stream broke.
    Transport {
        /// Bytes staged before the failure.
        written: u64,
        /// Transport error text.
        error: String,
    },
    /// The remote answered with a non-success status.
    BadStatus(u16),
    /// Advertised or observed length exceeds the ceiling.
    TooLarge {
        /// Advertised length, or bytes seen when the ceiling was crossed.
        size: u64,
        /// Ceiling in force.
        limit: u64,
    },
    /// The scratch file could not be created or written.
    Stage {
        /// Bytes staged before the failure.
        written: u64,
        /// I/O error text.
        error: String,
    },
}

/// GET `url` and stream the body into `scratch`, enforcing `limit`.
///
/// Returns the number of bytes staged.
pub(crate) async fn fetch_to_scratch(
    client: &reqwest::Client,
    url: &Url,
    scratch: &ScratchFile,
    limit: Option<u64>,
) -> Result<u64, FetchFailure> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| FetchFailure::Transport {
            written: 0,
            error: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchFailure::BadStatus(status.as_u16()));
    }

    if let (Some(limit), Some(advertised)) = (limit, response.content_length()) {
        if advertised > limit {
            return Err(FetchFailure::TooLarge {
                size: advertised,
                limit,
            });
        }
    }

    let mut file = scratch.create().await.map_err(|e| FetchFailure::Stage {
        written: 0,
        error: e.to_string(),
    })?;

    let mut written: u64 = 0;
    let mut stream = std::pin::pin!(response.bytes_stream());
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchFailure::Transport {
            written,
            error: e.to_string(),
        })?;

        let next = written.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        if let Some(limit) = limit {
            if next > limit {
                return Err(FetchFailure::TooLarge { size: next, limit });
            }
        }

        file.write_all(&chunk)
            .await
            .map_err(|e| FetchFailure::Stage {
                written,
                error: e.to_string(),
            })?;
        written = next;
    }

    file.flush().await.map_err(|e| FetchFailure::Stage {
        written,
        error: e.to_string(),
    })?;

    debug!(url = %url, written, path = %scratch.path().display(), "body staged");
    Ok(written)
}
