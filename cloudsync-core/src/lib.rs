mod client;

pub use client::{
    ApiErrorClass, QuotaInfo, RemoteClient, RemoteError, Resource, ResourceList, ResourceType,
    UploadProgress, UploadSession,
};
