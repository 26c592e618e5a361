//! Answering search requests from remote peers.

use std::sync::Arc;

use tracing::trace;

use slsk_shares::{SearchQuery, ShareError, ShareIndex, SharedFile};

/// What the resolver needs to know about upload capacity.
///
/// Implemented over the upload queue by the daemon; a seam trait so this
/// crate does not depend on the scheduler.
pub trait UploadCapacity: Send + Sync {
    /// True if any non-leecher group has a free upload slot.
    fn has_free_slot(&self) -> bool;
    /// Total number of queued (not yet released) uploads.
    fn queue_length(&self) -> usize;
    /// Rolling average upload speed, bytes per second.
    fn average_speed(&self) -> u64;
}

/// Tunables for the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResolverConfig {
    /// Upper bound on the number of files in one response.
    pub max_files_per_response: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            max_files_per_response: 250,
        }
    }
}

/// A response to a remote peer's search.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SearchResponse {
    /// Our username, as the peer should address us.
    pub username: String,
    /// The peer's search token, echoed back.
    pub token: u32,
    /// 1 if an upload could begin immediately, 0 otherwise.
    pub free_upload_slots: u8,
    /// Our rolling average upload speed, bytes per second.
    pub upload_speed: u64,
    /// How many uploads are queued ahead of a new request.
    pub queue_length: usize,
    /// The matched files.  Never empty: an empty match produces no
    /// response at all.
    pub files: Vec<SharedFile>,
}

/// Serves remote peers' searches out of the share index.
pub struct SearchResolver {
    /// The index to search.
    index: Arc<ShareIndex>,
    /// Capacity figures for the response header.
    capacity: Arc<dyn UploadCapacity>,
    /// Tunables.
    config: ResolverConfig,
}

impl SearchResolver {
    /// Construct a resolver over the given index and capacity source.
    pub fn new(
        index: Arc<ShareIndex>,
        capacity: Arc<dyn UploadCapacity>,
        config: ResolverConfig,
    ) -> Self {
        SearchResolver {
            index,
            capacity,
            config,
        }
    }

    /// Answer one incoming search.
    ///
    /// Returns `Ok(None)` when the peer must not receive a response:
    /// the query matched nothing, was too short, had no include terms,
    /// or came from a blacklisted username.  (The query gates live in
    /// the share index, which applies them before doing any work.)
    pub fn respond(
        &self,
        local_username: &str,
        peer_username: &str,
        token: u32,
        query: &str,
    ) -> Result<Option<SearchResponse>, ShareError> {
        let mut files = self
            .index
            .search(&SearchQuery::new(query, peer_username))?;
        if files.is_empty() {
            return Ok(None);
        }
        files.truncate(self.config.max_files_per_response);
        trace!(
            peer = %peer_username,
            token,
            matches = files.len(),
            "answering search"
        );
        Ok(Some(SearchResponse {
            username: local_username.to_owned(),
            token,
            free_upload_slots: u8::from(self.capacity.has_free_slot()),
            upload_speed: self.capacity.average_speed(),
            queue_length: self.capacity.queue_length(),
            files,
        }))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use slsk_shares::{FileProperties, MemoryRepository, Share, SharesConfig, LOCAL_HOST};

    /// Capacity with fixed answers.
    struct FixedCapacity {
        /// Whether a slot is free.
        free: bool,
    }

    impl UploadCapacity for FixedCapacity {
        fn has_free_slot(&self) -> bool {
            self.free
        }
        fn queue_length(&self) -> usize {
            7
        }
        fn average_speed(&self) -> u64 {
            1_000
        }
    }

    fn resolver(free: bool, max_files: usize) -> SearchResolver {
        let mut repo = MemoryRepository::new(vec![Share {
            alias: "Music".into(),
        }]);
        for name in ["one.mp3", "two.mp3", "three.mp3"] {
            repo.insert(
                SharedFile {
                    filename: format!(r"Music\{name}"),
                    size: 1000,
                    properties: FileProperties::default(),
                },
                format!("/srv/{name}"),
            );
        }
        let index = Arc::new(ShareIndex::new(SharesConfig::default()));
        index
            .add_or_update_host(LOCAL_HOST, vec![], Arc::new(repo))
            .unwrap();
        SearchResolver::new(
            index,
            Arc::new(FixedCapacity { free }),
            ResolverConfig {
                max_files_per_response: max_files,
            },
        )
    }

    #[test]
    fn responds_with_matches_and_capacity() {
        let r = resolver(true, 250);
        let resp = r
            .respond("us", "peer", 42, "mp3")
            .unwrap()
            .expect("matches exist");
        assert_eq!(resp.username, "us");
        assert_eq!(resp.token, 42);
        assert_eq!(resp.free_upload_slots, 1);
        assert_eq!(resp.upload_speed, 1_000);
        assert_eq!(resp.queue_length, 7);
        assert_eq!(resp.files.len(), 3);
    }

    #[test]
    fn empty_match_yields_no_response() {
        let r = resolver(true, 250);
        assert!(r.respond("us", "peer", 42, "zzz_nothing").unwrap().is_none());
        // Too-short queries are gated before the index is searched.
        assert!(r.respond("us", "peer", 42, "mp").unwrap().is_none());
    }

    #[test]
    fn response_work_is_bounded() {
        let r = resolver(false, 2);
        let resp = r.respond("us", "peer", 1, "mp3").unwrap().expect("matches");
        assert_eq!(resp.files.len(), 2);
        assert_eq!(resp.free_upload_slots, 0);
    }
}
