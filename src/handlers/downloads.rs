//! Serves published objects behind expiring signed links.
//!
//! A link is `/hunnoi/downloads/{key}?expires={unix}&signature={hex}`. The
//! key is checked against the storage root before the signature, so a
//! traversal attempt is a 404 whatever it is signed with.

use crate::{error::AppError, pipeline::storage::object_path, state::AppState};
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub expires: i64,
    pub signature: String,
}

pub async fn download(
    state: web::Data<AppState>,
    key: web::Path<String>,
    query: web::Query<DownloadQuery>,
) -> Result<HttpResponse, AppError> {
    let key = key.into_inner();
    let publisher = &state.publisher;

    let path = object_path(publisher.root(), &key)?;
    if let Err(err) = publisher
        .signer()
        .verify(&key, query.expires, &query.signature, chrono::Utc::now().timestamp())
    {
        warn!(%key, error = %err, "Download refused");
        return Err(err.into());
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("object {} no longer exists", key)));
        }
        Err(err) => return Err(AppError::Internal(err.to_string())),
    };
    let len = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .len();

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    info!(%key, bytes = len, "Serving download");

    Ok(HttpResponse::Ok()
        .content_type(content_type_for(&path))
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(filename)],
        })
        .no_chunking(len)
        .streaming(file_chunks(file)))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("zip") => "application/zip",
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("aac") => "audio/mp4",
        Some("opus") | Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = Result<web::Bytes, std::io::Error>> {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some((web::Bytes::from(buf), file)))
    })
}
