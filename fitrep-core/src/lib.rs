mod client;
mod encoding;
mod proxy;

pub use client::{
    ApiErrorClass, CommitInfo, ContentEntry, ContentsClient, ContentsError, EntryType, RemoteFile,
    Repository,
};
pub use encoding::{decode_content, encode_content};
pub use reqwest::StatusCode;
pub use proxy::{
    AccountCreateRequest, AccountResponse, CredentialsMode, LoginRequest, OriginPolicy,
    ProxyClient, ProxyEndpoint, ProxyError, SaveResponse,
};
