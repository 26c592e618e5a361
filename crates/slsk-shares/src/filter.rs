//! The search and filter language.
//!
//! The same token grammar serves two places: the server-side resolver,
//! which matches incoming queries against shared files by their *terms*,
//! and client-side result filtering, which additionally honours numeric
//! thresholds and flag tokens.  Keeping one parser for both is what makes
//! the two ends agree about which files a query names.
//!
//! Grammar, token by token (whitespace separated):
//!
//! - `term`: an AND-include, meaning the file's full path must contain it,
//!   case-insensitively.
//! - `-term`: an exclusion; a path containing the term does not match.
//! - `key:value`: a modifier.  Recognised keys: `minbr`/`minbitrate`,
//!   `minbd`/`minbitdepth`, `minfs`/`minfilesize`, `minlen`/`minlength`,
//!   `minfif`/`minfilesinfolder`.  Unrecognised keys (and unparsable
//!   values) are discarded.
//! - `iscbr`, `isvbr`, `islossless`, `islossy`: flag tokens.  Note that
//!   `iscbr isvbr` can never match anything: both must hold and cannot.

use serde::{Deserialize, Serialize};

use crate::repository::SharedFile;

/// A parsed search/filter expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Substrings the path must contain (lowercased).
    includes: Vec<String>,
    /// Substrings the path must not contain (lowercased).
    excludes: Vec<String>,
    /// Minimum bitrate, in kbps.
    min_bitrate: Option<u32>,
    /// Minimum bit depth.
    min_bit_depth: Option<u32>,
    /// Minimum file size, in bytes.
    min_file_size: Option<u64>,
    /// Minimum track length, in seconds.
    min_length: Option<u32>,
    /// Minimum number of files in the containing folder.
    min_files_in_folder: Option<u32>,
    /// Only constant-bitrate files match.
    is_cbr: bool,
    /// Only variable-bitrate files match.
    is_vbr: bool,
    /// Only lossless files match.
    is_lossless: bool,
    /// Only lossy files match.
    is_lossy: bool,
}

impl SearchFilter {
    /// Parse a filter expression.
    ///
    /// Parsing never fails; malformed modifiers are discarded.
    pub fn parse(text: &str) -> Self {
        let mut filter = SearchFilter::default();
        for token in text.split_whitespace() {
            let lowered = token.to_lowercase();
            match lowered.as_str() {
                "iscbr" => filter.is_cbr = true,
                "isvbr" => filter.is_vbr = true,
                "islossless" => filter.is_lossless = true,
                "islossy" => filter.is_lossy = true,
                _ if lowered.contains(':') => filter.apply_modifier(&lowered),
                _ if lowered.starts_with('-') && lowered.len() > 1 => {
                    filter.excludes.push(lowered[1..].to_owned());
                }
                _ if !lowered.is_empty() && lowered != "-" => {
                    filter.includes.push(lowered);
                }
                _ => {}
            }
        }
        filter
    }

    /// Interpret one `key:value` modifier token, discarding it if the key
    /// is unknown or the value does not parse.
    fn apply_modifier(&mut self, token: &str) {
        let Some((key, value)) = token.split_once(':') else {
            return;
        };
        match key {
            "minbr" | "minbitrate" => self.min_bitrate = value.parse().ok(),
            "minbd" | "minbitdepth" => self.min_bit_depth = value.parse().ok(),
            "minfs" | "minfilesize" => self.min_file_size = value.parse().ok(),
            "minlen" | "minlength" => self.min_length = value.parse().ok(),
            "minfif" | "minfilesinfolder" => self.min_files_in_folder = value.parse().ok(),
            _ => {}
        }
    }

    /// Return true if the expression has at least one include term.
    ///
    /// A query with no include terms names no files at all; the resolver
    /// answers such queries with nothing rather than with everything.
    pub fn has_include_terms(&self) -> bool {
        !self.includes.is_empty()
    }

    /// Apply only the *term* semantics (includes and excludes) to a full
    /// path.  This is what the server-side resolver uses; out-of-band
    /// modifiers do not constrain it.
    pub fn matches_terms(&self, path: &str) -> bool {
        let lowered = path.to_lowercase();
        self.includes.iter().all(|t| lowered.contains(t.as_str()))
            && !self.excludes.iter().any(|t| lowered.contains(t.as_str()))
    }

    /// Apply the full filter to a file: terms, numeric thresholds, and
    /// flag tokens.
    ///
    /// `files_in_folder` supplies the folder context for `minfif`; pass
    /// `None` where the context is unknown, in which case a `minfif`
    /// constraint fails closed.
    pub fn matches(&self, file: &SharedFile, files_in_folder: Option<u32>) -> bool {
        if !self.matches_terms(&file.filename) {
            return false;
        }
        let props = &file.properties;
        if let Some(min) = self.min_bitrate {
            if props.bitrate.map_or(true, |b| b < min) {
                return false;
            }
        }
        if let Some(min) = self.min_bit_depth {
            if props.bit_depth.map_or(true, |b| b < min) {
                return false;
            }
        }
        if let Some(min) = self.min_file_size {
            if file.size < min {
                return false;
            }
        }
        if let Some(min) = self.min_length {
            if props.length.map_or(true, |l| l < min) {
                return false;
            }
        }
        if let Some(min) = self.min_files_in_folder {
            if files_in_folder.map_or(true, |n| n < min) {
                return false;
            }
        }
        if self.is_cbr && props.is_variable_bit_rate != Some(false) {
            return false;
        }
        if self.is_vbr && props.is_variable_bit_rate != Some(true) {
            return false;
        }
        if self.is_lossless && !props.is_lossless() {
            return false;
        }
        if self.is_lossy && props.is_lossless() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::repository::FileProperties;

    fn file(path: &str, size: u64, props: FileProperties) -> SharedFile {
        SharedFile {
            filename: path.to_owned(),
            size,
            properties: props,
        }
    }

    fn mp3(path: &str, bitrate: u32, vbr: bool) -> SharedFile {
        file(
            path,
            5_000_000,
            FileProperties {
                bitrate: Some(bitrate),
                length: Some(240),
                is_variable_bit_rate: Some(vbr),
                ..Default::default()
            },
        )
    }

    fn flac(path: &str) -> SharedFile {
        file(
            path,
            30_000_000,
            FileProperties {
                bit_depth: Some(16),
                sample_rate: Some(44_100),
                length: Some(240),
                ..Default::default()
            },
        )
    }

    #[test]
    fn include_and_exclude_terms() {
        let f = SearchFilter::parse("beatles -remaster");
        assert!(f.matches_terms(r"Music\The Beatles\Abbey Road\01 Come Together.mp3"));
        assert!(!f.matches_terms(r"Music\The Beatles\Abbey Road [2019 Remaster]\01.mp3"));
        assert!(!f.matches_terms(r"Music\The Kinks\Arthur\01.mp3"));
    }

    #[test]
    fn terms_are_case_insensitive() {
        let f = SearchFilter::parse("BEATLES");
        assert!(f.matches_terms(r"music\the beatles\something.mp3"));
    }

    #[test]
    fn all_includes_must_match() {
        let f = SearchFilter::parse("beatles abbey");
        assert!(f.matches_terms(r"The Beatles\Abbey Road\02.mp3"));
        assert!(!f.matches_terms(r"The Beatles\Revolver\02.mp3"));
    }

    #[test]
    fn modifiers_do_not_constrain_terms() {
        let f = SearchFilter::parse("beatles minbr:320");
        // Term matching ignores the modifier entirely.
        assert!(f.matches_terms(r"The Beatles\low_quality.mp3"));
        // Full matching enforces it.
        assert!(!f.matches(&mp3(r"The Beatles\low.mp3", 128, false), None));
        assert!(f.matches(&mp3(r"The Beatles\high.mp3", 320, false), None));
    }

    #[test]
    fn modifier_aliases() {
        let long = SearchFilter::parse("x minbitrate:192 minbitdepth:16 minfilesize:1 minlength:60 minfilesinfolder:2");
        let short = SearchFilter::parse("x minbr:192 minbd:16 minfs:1 minlen:60 minfif:2");
        assert_eq!(long, short);
    }

    #[test]
    fn malformed_modifier_is_discarded() {
        let f = SearchFilter::parse("beatles minbr:loud unknintr:77");
        assert!(f.matches(&mp3(r"beatles\a.mp3", 96, false), None));
    }

    #[test]
    fn cbr_vbr_flags() {
        let f = SearchFilter::parse("a iscbr");
        assert!(f.matches(&mp3("a.mp3", 320, false), None));
        assert!(!f.matches(&mp3("a.mp3", 320, true), None));

        // A flac has no bitrate mode at all; neither flag can hold.
        assert!(!f.matches(&flac("a.flac"), None));

        // Both flags together eliminate everything.
        let both = SearchFilter::parse("a iscbr isvbr");
        assert!(!both.matches(&mp3("a.mp3", 320, false), None));
        assert!(!both.matches(&mp3("a.mp3", 320, true), None));
    }

    #[test]
    fn lossless_and_lossy() {
        let lossless = SearchFilter::parse("a islossless");
        assert!(lossless.matches(&flac("a.flac"), None));
        assert!(!lossless.matches(&mp3("a.mp3", 320, false), None));

        let lossy = SearchFilter::parse("a islossy");
        assert!(!lossy.matches(&flac("a.flac"), None));
        assert!(lossy.matches(&mp3("a.mp3", 320, false), None));
    }

    #[test]
    fn files_in_folder_threshold() {
        let f = SearchFilter::parse("a minfif:3");
        let target = mp3("a.mp3", 320, false);
        assert!(f.matches(&target, Some(5)));
        assert!(!f.matches(&target, Some(2)));
        // Unknown folder context fails closed.
        assert!(!f.matches(&target, None));
    }

    #[test]
    fn missing_properties_fail_thresholds() {
        let f = SearchFilter::parse("a minbr:128");
        let bare = file("a.mp3", 1, FileProperties::default());
        assert!(!f.matches(&bare, None));
    }

    #[test]
    fn lone_dash_and_empty_tokens() {
        let f = SearchFilter::parse("  -   beatles  ");
        assert!(f.has_include_terms());
        assert!(f.matches_terms("the beatles"));
    }

    #[test]
    fn exclusion_only_query_has_no_terms() {
        let f = SearchFilter::parse("-remaster");
        assert!(!f.has_include_terms());
    }
}
