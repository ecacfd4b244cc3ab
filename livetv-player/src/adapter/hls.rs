//! Manifest-based segmented stream adapter (HLS demuxed in-process).
//!
//! Resolves the endpoint to a media playlist (following the best variant of a
//! master playlist), reports ready as soon as that manifest parses, then keeps
//! pulling new segments into the sink while refreshing the live playlist.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use livetv_core::config::HlsConfig;
use m3u8_rs::{MediaPlaylist, Playlist};
use tracing::{debug, info, warn};
use url::Url;

use super::{AdapterEvents, AdapterKind, AttachContext, AttachedTask, BackendAdapter};
use crate::error::AdapterError;
use crate::sink::{Capabilities, SinkLease};
use crate::source::StreamSource;
use crate::util;

/// Manifests larger than this are not playlists (1 MB)
const MAX_PLAYLIST_SIZE: usize = 1024 * 1024;
const M3U8_HEADER: &[u8] = b"#EXTM3U";
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);
const MIN_REFRESH: Duration = Duration::from_secs(1);

pub struct HlsAdapter {
    client: reqwest::Client,
    config: HlsConfig,
    task: Option<AttachedTask>,
}

impl HlsAdapter {
    #[must_use]
    pub const fn new(client: reqwest::Client, config: HlsConfig) -> Self {
        Self {
            client,
            config,
            task: None,
        }
    }
}

#[async_trait]
impl BackendAdapter for HlsAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Hls
    }

    fn probe(&self, capabilities: &Capabilities) -> bool {
        capabilities.media_source
    }

    fn attach(&mut self, ctx: AttachContext) -> Result<(), AdapterError> {
        let AttachContext { source, sink, events } = ctx;
        let session = HlsSession {
            client: self.client.clone(),
            config: self.config.clone(),
            sink,
            events: events.clone(),
        };
        self.task = Some(AttachedTask::spawn(events, session.run(source)));
        Ok(())
    }

    async fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}

/// State of one attachment's download loop.
struct HlsSession {
    client: reqwest::Client,
    config: HlsConfig,
    sink: SinkLease,
    events: AdapterEvents,
}

impl HlsSession {
    async fn run(self, source: StreamSource) -> Result<(), AdapterError> {
        let (playlist_url, mut playlist) = self.resolve_media_playlist(source.url().clone()).await?;

        info!(
            url = %playlist_url,
            segments = playlist.segments.len(),
            media_sequence = playlist.media_sequence,
            live = !playlist.end_list,
            "Media playlist parsed"
        );
        self.events.ready();

        let mut next_sequence = if playlist.end_list {
            playlist.media_sequence
        } else {
            let skip = playlist
                .segments
                .len()
                .saturating_sub(self.config.live_edge_segments);
            playlist.media_sequence + skip as u64
        };
        let mut failures: u32 = 0;

        loop {
            let pending: Vec<(u64, String)> = playlist
                .segments
                .iter()
                .enumerate()
                .map(|(i, segment)| (playlist.media_sequence + i as u64, segment.uri.clone()))
                .filter(|(sequence, _)| *sequence >= next_sequence)
                .collect();
            let fetched_any = !pending.is_empty();

            for (sequence, uri) in pending {
                let segment_url = playlist_url.join(&uri)?;
                match self.fetch(&segment_url).await {
                    Ok(data) => {
                        debug!(sequence, bytes = data.len(), "Segment fetched");
                        self.sink.write(data)?;
                        next_sequence = sequence + 1;
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        self.transient_failure(failures, format!("segment {sequence}: {e}"), e)
                            .await?;
                        break;
                    }
                }
            }

            if playlist.end_list {
                let last = playlist.media_sequence + playlist.segments.len() as u64;
                if next_sequence >= last {
                    info!(next_sequence, "Playlist ended");
                    return Ok(());
                }
                // A segment of a finished playlist failed, retry it
                continue;
            }

            // Re-poll after a full target duration when new media arrived, half otherwise
            let target = Duration::from_secs_f64(playlist.target_duration as f64).max(MIN_REFRESH);
            let refresh = if fetched_any { target } else { (target / 2).max(MIN_REFRESH) };
            tokio::time::sleep(refresh).await;

            match self.fetch_media_playlist(&playlist_url).await {
                Ok(refreshed) => {
                    if next_sequence < refreshed.media_sequence {
                        warn!(
                            expected = next_sequence,
                            oldest = refreshed.media_sequence,
                            "Fell behind the live window, skipping ahead"
                        );
                        next_sequence = refreshed.media_sequence;
                    }
                    playlist = refreshed;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    self.transient_failure(failures, format!("playlist refresh: {e}"), e)
                        .await?;
                }
            }
        }
    }

    /// Absorb a failure after ready, or give up once too many happen in a row.
    async fn transient_failure(
        &self,
        failures: u32,
        context: String,
        error: AdapterError,
    ) -> Result<(), AdapterError> {
        if failures > self.config.max_consecutive_failures {
            return Err(error);
        }
        warn!(
            failures,
            max_failures = self.config.max_consecutive_failures,
            "Transient HLS failure, retrying: {context}"
        );
        self.events.log(context);
        util::backoff(failures, INITIAL_BACKOFF, MAX_BACKOFF).await;
        Ok(())
    }

    async fn resolve_media_playlist(&self, mut url: Url) -> Result<(Url, MediaPlaylist), AdapterError> {
        for _ in 0..self.config.max_playlist_depth {
            match parse_playlist(&self.fetch_playlist_body(&url).await?)? {
                Playlist::MediaPlaylist(media) => return Ok((url, media)),
                Playlist::MasterPlaylist(master) => {
                    let variant = master
                        .variants
                        .iter()
                        .filter(|variant| !variant.is_i_frame)
                        .max_by_key(|variant| variant.bandwidth)
                        .ok_or_else(|| {
                            AdapterError::Playlist("master playlist has no variants".to_string())
                        })?;
                    debug!(
                        bandwidth = variant.bandwidth,
                        uri = %variant.uri,
                        "Following master playlist variant"
                    );
                    url = url.join(&variant.uri)?;
                }
            }
        }

        Err(AdapterError::Playlist(format!(
            "playlists nested deeper than {}",
            self.config.max_playlist_depth
        )))
    }

    async fn fetch_media_playlist(&self, url: &Url) -> Result<MediaPlaylist, AdapterError> {
        match parse_playlist(&self.fetch_playlist_body(url).await?)? {
            Playlist::MediaPlaylist(media) => Ok(media),
            Playlist::MasterPlaylist(_) => Err(AdapterError::Playlist(
                "expected a media playlist on refresh".to_string(),
            )),
        }
    }

    /// Read a manifest body, bailing out early when it is clearly not one:
    /// the endpoint may just as well be serving an endless transport stream.
    async fn fetch_playlist_body(&self, url: &Url) -> Result<Bytes, AdapterError> {
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::Status(response.status()));
        }

        let mut body = BytesMut::new();
        let mut header_checked = false;
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);

            if !header_checked && body.len() >= M3U8_HEADER.len() + 3 {
                if !has_m3u8_header(&body) {
                    return Err(AdapterError::Playlist("missing #EXTM3U header".to_string()));
                }
                header_checked = true;
            }
            if body.len() > MAX_PLAYLIST_SIZE {
                return Err(AdapterError::Playlist(format!(
                    "manifest exceeds {} KB",
                    MAX_PLAYLIST_SIZE / 1024
                )));
            }
        }

        if !has_m3u8_header(&body) {
            return Err(AdapterError::Playlist("missing #EXTM3U header".to_string()));
        }
        Ok(body.freeze())
    }

    async fn fetch(&self, url: &Url) -> Result<Bytes, AdapterError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::Status(response.status()));
        }
        Ok(response.bytes().await?)
    }
}

/// `#EXTM3U` at the start, tolerating a UTF-8 BOM.
fn has_m3u8_header(body: &[u8]) -> bool {
    body.strip_prefix(b"\xEF\xBB\xBF".as_slice())
        .unwrap_or(body)
        .starts_with(M3U8_HEADER)
}

fn parse_playlist(body: &[u8]) -> Result<Playlist, AdapterError> {
    m3u8_rs::parse_playlist_res(body)
        .map_err(|_| AdapterError::Playlist("malformed M3U8 playlist".to_string()))
}
