use std::fmt;

use url::Url;

use crate::error::{PlaybackError, PlaybackResult};

/// A live channel and the single HTTP endpoint its stream is fetched from.
///
/// Carries no protocol hint: adapters find out what the endpoint serves by
/// trying to demux it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    channel_id: String,
    url: Url,
}

impl StreamSource {
    pub fn new(channel_id: impl Into<String>, url: &str) -> PlaybackResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| PlaybackError::InvalidSource(format!("{url}: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(PlaybackError::InvalidSource(format!(
                "unsupported scheme {:?}, expected http or https",
                url.scheme()
            )));
        }

        Ok(Self {
            channel_id: channel_id.into(),
            url,
        })
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.channel_id, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_http_endpoints() {
        let source = StreamSource::new("5.1", "http://tuner.local:32400/livetv/5.1/stream").unwrap();
        assert_eq!(source.channel_id(), "5.1");
        assert_eq!(source.url().path(), "/livetv/5.1/stream");

        assert!(StreamSource::new("7", "https://example.com/live/7.m3u8").is_ok());
    }

    #[test]
    fn test_rejects_invalid_endpoints() {
        assert!(matches!(
            StreamSource::new("1", "not a url"),
            Err(PlaybackError::InvalidSource(_))
        ));
        assert!(matches!(
            StreamSource::new("1", "rtmp://live.example.com/app/stream"),
            Err(PlaybackError::InvalidSource(_))
        ));
    }
}
