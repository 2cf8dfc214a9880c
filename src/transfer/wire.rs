//! Request and response bodies of the filesystem endpoint.
//!
//! Shared by the host-side transfer engine and the device emulator so both
//! ends agree on field names.

use serde::{Deserialize, Serialize};

/// GET: open a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoRequest {
    pub file_name: String,
}

/// Response to [`FileInfoRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    #[serde(rename = "rxID")]
    pub rx_id: u32,
    pub file_size: u64,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_crc32: Option<String>,
}

/// GET: fetch one download chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFetch {
    #[serde(rename = "rxID")]
    pub rx_id: u32,
    pub chunk_no: u32,
}

/// Response to [`ChunkFetch`]. The device attaches `fileCrc32` to the last
/// chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkData {
    #[serde(rename = "rxID")]
    pub rx_id: u32,
    pub chunk_no: u32,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_crc32: Option<String>,
}

/// PUT: open an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_crc32: String,
}

/// Response to [`UploadRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadGrant {
    #[serde(rename = "txID")]
    pub tx_id: u32,
    pub chunk_size: u64,
}

/// PUT: send one upload chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUpload {
    #[serde(rename = "txID")]
    pub tx_id: u32,
    pub chunk_no: u32,
    pub data: String,
}

/// Response to [`ChunkUpload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    #[serde(rename = "txID", default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_no: Option<u32>,
}

/// DELETE: remove a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    pub remove_file: String,
}

/// GET: list the entries of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDir {
    pub list_dir: String,
}

/// What a directory entry is. Travels as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum EntryKind {
    Directory,
    RegularFile,
    Symlink,
    Other,
}

impl From<u8> for EntryKind {
    fn from(raw: u8) -> Self {
        match raw {
            0 => EntryKind::Directory,
            1 => EntryKind::RegularFile,
            2 => EntryKind::Symlink,
            _ => EntryKind::Other,
        }
    }
}

impl From<EntryKind> for u8 {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Directory => 0,
            EntryKind::RegularFile => 1,
            EntryKind::Symlink => 2,
            EntryKind::Other => 3,
        }
    }
}

/// One element of a [`ListDir`] response. The device answers
/// `{"<dir>": [DirEntry, ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    /// Full path on the device.
    pub path: String,
    /// Zero for directories.
    #[serde(default)]
    pub file_size: u64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_field_spelling() {
        let fetch = ChunkFetch {
            rx_id: 7,
            chunk_no: 2,
        };
        assert_eq!(
            serde_json::to_value(fetch).unwrap(),
            json!({"rxID": 7, "chunkNo": 2})
        );

        let grant: UploadGrant =
            serde_json::from_value(json!({"txID": 3, "chunkSize": 1024})).unwrap();
        assert_eq!(grant.tx_id, 3);
        assert_eq!(grant.chunk_size, 1024);
    }

    #[test]
    fn test_optional_crc_omitted_when_absent() {
        let info = FileInfo {
            rx_id: 1,
            file_size: 10,
            chunk_size: 4,
            file_crc32: None,
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"rxID": 1, "fileSize": 10, "chunkSize": 4})
        );
    }

    #[test]
    fn test_dir_entry_kind_travels_as_number() {
        let entry: DirEntry = serde_json::from_value(
            json!({"path": "/sys/user/music/a.mp3", "fileSize": 3, "type": 1}),
        )
        .unwrap();
        assert_eq!(entry.kind, EntryKind::RegularFile);

        let dir: DirEntry =
            serde_json::from_value(json!({"path": "/sys/user/music/sub", "type": 0})).unwrap();
        assert_eq!(dir.kind, EntryKind::Directory);
        assert_eq!(dir.file_size, 0);

        let odd: DirEntry = serde_json::from_value(json!({"path": "/p", "type": 9})).unwrap();
        assert_eq!(odd.kind, EntryKind::Other);
        assert_eq!(serde_json::to_value(&dir).unwrap()["type"], 0);
    }
}
