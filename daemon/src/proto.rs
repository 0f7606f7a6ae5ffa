//! Wire types of the line-delimited JSON session protocol.
//!
//! Every request is one line: `{"Type": "...", "Payload": {...}}`.
//! Responses mirror it with `Type` either `"result"` or `"error"`;
//! errors carry `{"Message": "..."}`. Read data travels base64
//! encoded.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Payload", default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(rename = "Type")]
    pub kind: &'static str,
    #[serde(rename = "Payload")]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct OpenResponse {
    #[serde(rename = "FD")]
    pub fd: u64,
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    #[serde(rename = "FD")]
    pub fd: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    #[serde(rename = "FD")]
    pub fd: u64,
    #[serde(rename = "Length")]
    pub length: usize,
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    #[serde_as(as = "Base64")]
    #[serde(rename = "Data")]
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ListDirRequest {
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "INode")]
    pub inode: u64,
    #[serde(rename = "IsDir")]
    pub is_dir: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListDirResponse {
    #[serde(rename = "Entries")]
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ForgetRequest {
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "Message")]
    pub message: String,
}

/// The empty success payload, `{}`.
#[derive(Debug, Serialize, Default)]
pub struct Empty {}
