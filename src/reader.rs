use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::debug;

use crate::domain::DandisetId;
use crate::error::SyncError;
use crate::hdf5::{self, ByteSource, FileSource};
use crate::lindi::{self, ChunkSource};
use crate::tree::NodeTree;

/// Opens NWB files as navigable trees.
pub trait FileReader {
    /// Lightweight path: a JSON index describing the file's hierarchy.
    fn open_remote_index(&self, url: &str) -> Result<NodeTree, SyncError>;
    /// Fallback path: the HDF5 file itself, read with range requests.
    fn open_direct(&self, url: &str) -> Result<NodeTree, SyncError>;
}

/// Where an asset can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUrls {
    api_base_url: String,
    lindi_base_url: String,
}

impl AssetUrls {
    pub fn new(api_base_url: &str, lindi_base_url: &str) -> Self {
        Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            lindi_base_url: lindi_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn index_url(&self, dataset_id: &DandisetId, asset_id: &str) -> String {
        format!(
            "{}/dandi/dandisets/{}/assets/{}/nwb.lindi.json",
            self.lindi_base_url, dataset_id, asset_id
        )
    }

    pub fn download_url(&self, asset_id: &str) -> String {
        format!("{}/assets/{}/download/", self.api_base_url, asset_id)
    }
}

#[derive(Clone)]
pub struct HttpFileReader {
    client: Client,
}

impl HttpFileReader {
    pub fn new(timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dandi-mirror/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::DirectAccess(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::DirectAccess(err.to_string()))?;
        Ok(Self { client })
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self.client.get(url).send().map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("{url} returned status {}", response.status().as_u16()));
        }
        let bytes = response.bytes().map_err(|err| err.to_string())?;
        Ok(bytes.to_vec())
    }
}

impl FileReader for HttpFileReader {
    fn open_remote_index(&self, url: &str) -> Result<NodeTree, SyncError> {
        let bytes = self.fetch(url).map_err(SyncError::RemoteIndex)?;
        lindi::parse_index_with(&bytes, Some(self))
    }

    /// Reads the file's metadata with range requests; only the blocks that
    /// hold headers, heaps and small values are downloaded. A file that turns
    /// out to be a JSON index is decoded as one.
    fn open_direct(&self, url: &str) -> Result<NodeTree, SyncError> {
        let source = HttpRangeSource::new(&self.client, url);
        if source.read_at(0, 1)? == b"{" {
            let body = self.fetch(url).map_err(SyncError::DirectAccess)?;
            return lindi::parse_index_with(&body, Some(self));
        }
        hdf5::read_tree(&source)
    }
}

impl ChunkSource for HttpFileReader {
    fn read_range(&self, url: &str, offset: u64, size: u64) -> Result<Vec<u8>, SyncError> {
        let fail = |message: String| SyncError::RemoteIndex(format!("{url}: {message}"));
        if size == 0 {
            return Ok(Vec::new());
        }
        let last = offset + size - 1;
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={offset}-{last}"))
            .send()
            .map_err(|err| fail(err.to_string()))?;
        let status = response.status();
        let body = response.bytes().map_err(|err| fail(err.to_string()))?;
        let bytes = match status {
            StatusCode::PARTIAL_CONTENT => body.to_vec(),
            StatusCode::OK => usize::try_from(offset)
                .ok()
                .and_then(|start| body.get(start..start + size as usize))
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            status => return Err(fail(format!("status {}", status.as_u16()))),
        };
        if bytes.len() as u64 != size {
            return Err(fail(format!(
                "expected {size} bytes at offset {offset}, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

const BLOCK_SIZE: u64 = 64 * 1024;

struct RangeState {
    url: String,
    blocks: HashMap<u64, Vec<u8>>,
    /// Set once a server answers a range request with the whole body.
    spilled: Option<FileSource>,
}

/// A remote file read through cached fixed-size blocks.
struct HttpRangeSource<'a> {
    client: &'a Client,
    state: RefCell<RangeState>,
}

impl<'a> HttpRangeSource<'a> {
    fn new(client: &'a Client, url: &str) -> Self {
        Self {
            client,
            state: RefCell::new(RangeState {
                url: url.to_string(),
                blocks: HashMap::new(),
                spilled: None,
            }),
        }
    }

    fn fetch_block(&self, state: &mut RangeState, index: u64) -> Result<(), SyncError> {
        let url = state.url.clone();
        let fail = |message: String| SyncError::DirectAccess(format!("{url}: {message}"));
        let start = index * BLOCK_SIZE;
        let end = start + BLOCK_SIZE - 1;
        let mut response = self
            .client
            .get(&url)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .map_err(|err| fail(err.to_string()))?;
        // later blocks skip the redirect to storage
        let final_url = response.url().to_string();

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let body = response.bytes().map_err(|err| fail(err.to_string()))?;
                state.blocks.insert(index, body.to_vec());
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                state.blocks.insert(index, Vec::new());
            }
            StatusCode::OK => {
                debug!(url = %url, "server ignored the range request, spooling the whole file");
                let mut file = tempfile::tempfile()
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                response
                    .copy_to(&mut file)
                    .map_err(|err| fail(err.to_string()))?;
                state.spilled = Some(FileSource::new(file));
            }
            status => return Err(fail(format!("status {}", status.as_u16()))),
        }
        state.url = final_url;
        Ok(())
    }
}

impl ByteSource for HttpRangeSource<'_> {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, SyncError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| hdf5::past_end(offset, len))?;
        let mut state = self.state.borrow_mut();
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while pos < end {
            if let Some(file) = &state.spilled {
                return file.read_at(offset, len);
            }
            let index = pos / BLOCK_SIZE;
            if !state.blocks.contains_key(&index) {
                self.fetch_block(&mut state, index)?;
                continue;
            }
            let block = &state.blocks[&index];
            let within = (pos - index * BLOCK_SIZE) as usize;
            if within >= block.len() {
                return Err(hdf5::past_end(offset, len));
            }
            let take = (block.len() - within).min((end - pos) as usize);
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_urls() {
        let urls = AssetUrls::new("https://api.dandiarchive.org/api/", "https://lindi.neurosift.org");
        let id: DandisetId = "000409".parse().unwrap();
        assert_eq!(
            urls.index_url(&id, "a1b2"),
            "https://lindi.neurosift.org/dandi/dandisets/000409/assets/a1b2/nwb.lindi.json"
        );
        assert_eq!(
            urls.download_url("a1b2"),
            "https://api.dandiarchive.org/api/assets/a1b2/download/"
        );
    }
}
