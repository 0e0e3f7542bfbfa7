//! Document endpoints: listing, upload and download of source files

use crate::api::ApiError;
use crate::api::documents::schemas::{DocumentList, UploadResponse};
use crate::core::engine::loader::is_valid_document_id;
use crate::infrastructure::settings::Settings;
use axum::extract::{Multipart, Path};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use di_axum::Inject;
use log::{error, info, warn};
use std::io::ErrorKind;

pub fn router() -> Router {
    Router::new()
        .route("/documents", get(list_documents))
        .route("/upload", post(upload_file))
        .route("/download/:file", get(download_file))
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()) {
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "txt" => "text/plain; charset=utf-8",
        Some(ext) if ext == "md" || ext == "markdown" => "text/markdown; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn list_documents(Inject(settings): Inject<Settings>) -> Result<Json<DocumentList>, ApiError> {
    let mut documents = Vec::new();

    let mut entries = match tokio::fs::read_dir(&settings.upload_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Json(DocumentList { documents })),
        Err(e) => {
            error!("failed to list {}: {e}", settings.upload_dir.display());
            return Err(ApiError::internal("failed to list documents"));
        }
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_file())
            .unwrap_or(false);
        if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
            documents.push(name.to_owned());
        }
    }
    documents.sort();

    Ok(Json(DocumentList { documents }))
}

async fn upload_file(
    Inject(settings): Inject<Settings>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_owned();
        if !is_valid_document_id(&file_name) {
            warn!("rejected upload with file name {file_name:?}");
            return Err(ApiError::bad_request("Invalid file name"));
        }

        let upload_error = |e: &dyn std::fmt::Display| {
            error!("failed to store upload {file_name}: {e}");
            ApiError::internal(format!("上传文件时出错: {e}"))
        };

        let data = field.bytes().await.map_err(|e| upload_error(&e))?;
        tokio::fs::create_dir_all(&settings.upload_dir)
            .await
            .map_err(|e| upload_error(&e))?;
        tokio::fs::write(settings.upload_dir.join(&file_name), &data)
            .await
            .map_err(|e| upload_error(&e))?;

        info!("stored upload {file_name} ({} bytes)", data.len());
        return Ok(Json(UploadResponse {
            message: format!("文件 {file_name} 已上传成功."),
        }));
    }

    Err(ApiError::bad_request("No file provided"))
}

async fn download_file(
    Inject(settings): Inject<Settings>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    if !is_valid_document_id(&file) {
        return Err(ApiError::bad_request("Invalid file name"));
    }

    let path = settings.upload_dir.join(&file);
    let is_file = tokio::fs::metadata(&path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(ApiError::not_found("File not found"));
    }

    let data = tokio::fs::read(&path).await.map_err(|e| {
        error!("failed to read {}: {e}", path.display());
        ApiError::internal("failed to read file")
    })?;

    let headers = [
        (header::CONTENT_TYPE, content_type_for(&file).to_owned()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file}\""),
        ),
    ];
    Ok((headers, data).into_response())
}

pub mod schemas {
    use serde::Serialize;

    #[derive(Serialize, Debug)]
    pub struct DocumentList {
        pub documents: Vec<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct UploadResponse {
        pub message: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type_for("a.PDF"), "application/pdf");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }
}
