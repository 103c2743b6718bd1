//! HTTP handlers for the three upload paths.
//! Bodies are consumed as streams so no request is ever buffered whole;
//! storage concerns are delegated to `ChunkService` and `FileModel`.

use crate::{
    errors::AppError,
    models::upload::{ChunkRequest, ChunkUploadResponse, UploadResponse, headers as h},
    multipart::{FieldBody, MultipartDecoder, MultipartField},
    services::{
        AppState,
        chunk_service::ChunkService,
        storage_layout::{ensure_file_name_safe, ensure_segment_safe, ensure_user_path_safe},
    },
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, header},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use percent_encoding::percent_decode_str;
use std::io;
use tracing::{debug, info};

/// `POST /api/files/upload-chunk`: store one chunk and assemble when it was the last one.
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let owner_id = owner_id(&headers)?;
    let req = chunk_request(&headers)?;
    ChunkService::validate(&owner_id, &req)?;

    state
        .chunks
        .receive_chunk(&owner_id, &req, body_stream(body))
        .await?;

    let progress = state.chunks.complete_if_ready(&owner_id, &req).await?;
    if !progress.is_complete() {
        return Ok(Json(ChunkUploadResponse {
            success: true,
            is_complete: Some(false),
            new_files: None,
            new_directories: None,
        }));
    }

    info!(
        owner_id = %owner_id,
        upload_id = %req.upload_id,
        file_name = %req.file_name,
        ?progress,
        "chunked upload complete"
    );
    let new_files = state.files.list(&owner_id, &req.path_in_view).await?;
    let new_directories = state.directories.list(&owner_id, &req.path_in_view).await?;

    Ok(Json(ChunkUploadResponse {
        success: true,
        is_complete: Some(true),
        new_files: Some(new_files),
        new_directories: Some(new_directories),
    }))
}

/// `POST /api/files/upload-stream`: the whole body is the file.
pub async fn upload_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>, AppError> {
    let owner_id = owner_id(&headers)?;
    let file_name = required_header(&headers, h::FILE_NAME)?.trim().to_string();
    let parent_path = optional_header(&headers, h::PARENT_PATH)?.unwrap_or_else(|| "/".into());
    let path_in_view =
        optional_header(&headers, h::PATH_IN_VIEW)?.unwrap_or_else(|| "/".into());

    ensure_segment_safe("ownerId", &owner_id)?;
    ensure_file_name_safe(&file_name)?;
    ensure_user_path_safe("parentPath", &parent_path)?;
    ensure_user_path_safe("pathInView", &path_in_view)?;

    let written = state
        .files
        .create_from_stream(&owner_id, &parent_path, &file_name, body_stream(body))
        .await?;
    info!(
        owner_id = %owner_id,
        file_name = %file_name,
        bytes = written,
        "stream upload complete"
    );

    listing_response(&state, &owner_id, &path_in_view).await
}

/// `POST /api/files/upload`: `multipart/form-data` with `path_in_view`,
/// `parent_path`, `name` and `contents`.
///
/// The form is decoded while it streams in, so the path fields have to
/// precede `contents`.
pub async fn upload_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>, AppError> {
    let owner_id = owner_id(&headers)?;
    ensure_segment_safe("ownerId", &owner_id)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let mut decoder = MultipartDecoder::from_content_type(content_type, body_stream(body))?;

    let mut form = FormTarget::default();
    let mut stored = false;
    while let Some(field) = decoder.next_field().await? {
        let MultipartField {
            name,
            file_name,
            content_type,
            body,
        } = field;
        match body {
            FieldBody::Value(value) => match name.as_str() {
                "path_in_view" => form.path_in_view = Some(value),
                "parent_path" => form.parent_path = Some(value),
                "name" => form.name = Some(value.trim().to_string()),
                "contents" if !stored => {
                    let (parent_path, name) = form.destination()?;
                    state.files.create(&owner_id, parent_path, name, &value).await?;
                    stored = true;
                }
                _ => debug!(field = %name, "ignoring form field"),
            },
            FieldBody::Stream(stream) if name == "contents" && !stored => {
                let (parent_path, target) = form.destination()?;
                let written = state
                    .files
                    .create_from_stream(
                        &owner_id,
                        parent_path,
                        target,
                        stream.map(|chunk| chunk.map_err(io::Error::other)),
                    )
                    .await?;
                debug!(
                    upload = file_name.as_deref().unwrap_or_default(),
                    content_type = content_type.as_deref().unwrap_or_default(),
                    bytes = written,
                    "stored form upload"
                );
                stored = true;
            }
            FieldBody::Stream(_) => debug!(field = %name, "skipping file field"),
        }
    }

    if !stored {
        return Err(AppError::bad_request("missing contents field"));
    }
    let path_in_view = form.path_in_view()?;
    listing_response(&state, &owner_id, &path_in_view).await
}

/// Path fields collected from a form before its `contents` arrive.
#[derive(Default)]
struct FormTarget {
    path_in_view: Option<String>,
    parent_path: Option<String>,
    name: Option<String>,
}

impl FormTarget {
    fn destination(&self) -> Result<(&str, &str), AppError> {
        let parent_path = self
            .parent_path
            .as_deref()
            .ok_or_else(|| AppError::bad_request("parent_path must precede contents"))?;
        let name = self
            .name
            .as_deref()
            .ok_or_else(|| AppError::bad_request("name must precede contents"))?;
        self.path_in_view()?;
        ensure_user_path_safe("parentPath", parent_path)?;
        ensure_file_name_safe(name)?;
        Ok((parent_path, name))
    }

    fn path_in_view(&self) -> Result<String, AppError> {
        let path = self
            .path_in_view
            .clone()
            .ok_or_else(|| AppError::bad_request("path_in_view is required"))?;
        ensure_user_path_safe("pathInView", &path)?;
        Ok(path)
    }
}

async fn listing_response(
    state: &AppState,
    owner_id: &str,
    path_in_view: &str,
) -> Result<Json<UploadResponse>, AppError> {
    let new_files = state.files.list(owner_id, path_in_view).await?;
    let new_directories = state.directories.list(owner_id, path_in_view).await?;
    Ok(Json(UploadResponse {
        success: true,
        new_files,
        new_directories,
    }))
}

fn body_stream(body: Body) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
}

/// The owner id is placed in the request by the authentication layer in front
/// of this service; its absence means the caller was not authenticated. It is
/// percent-decoded like every other upload header.
fn owner_id(headers: &HeaderMap) -> Result<String, AppError> {
    optional_header(headers, h::OWNER_ID)?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(AppError::unauthorized)
}

fn chunk_request(headers: &HeaderMap) -> Result<ChunkRequest, AppError> {
    Ok(ChunkRequest {
        upload_id: required_header(headers, h::FILE_ID)?,
        file_name: required_header(headers, h::FILE_NAME)?.trim().to_string(),
        parent_path: optional_header(headers, h::PARENT_PATH)?.unwrap_or_else(|| "/".into()),
        path_in_view: optional_header(headers, h::PATH_IN_VIEW)?.unwrap_or_else(|| "/".into()),
        chunk_index: numeric_header(headers, h::CHUNK_INDEX)?,
        total_chunks: numeric_header(headers, h::TOTAL_CHUNKS)?,
    })
}

/// Percent-decode a header value as UTF-8.
fn optional_header(headers: &HeaderMap, name: &str) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| AppError::bad_request(format!("{} header is not valid text", name)))?;
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| AppError::bad_request(format!("{} header is not valid UTF-8", name)))?;
    Ok(Some(decoded.into_owned()))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    optional_header(headers, name)?
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::bad_request(format!("missing {} header", name)))
}

fn numeric_header(headers: &HeaderMap, name: &str) -> Result<u32, AppError> {
    required_header(headers, name)?
        .trim()
        .parse::<u32>()
        .map_err(|_| AppError::bad_request(format!("{} must be a non-negative integer", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::upload::UploadResponse, multipart::decoder::MAX_VALUE_BYTES,
        routes::routes::spawn_test_server,
    };
    use reqwest::{Client, StatusCode};
    use tempfile::TempDir;

    fn chunk_headers(upload_id: &str, index: u32, total: u32) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (name, value) in [
            (h::OWNER_ID, "alice".to_string()),
            (h::FILE_NAME, "r%C3%A9sum%C3%A9%201.txt".to_string()),
            (h::PARENT_PATH, "%2Fdocs%2F".to_string()),
            (h::PATH_IN_VIEW, "/docs/".to_string()),
            (h::CHUNK_INDEX, index.to_string()),
            (h::TOTAL_CHUNKS, total.to_string()),
            (h::FILE_ID, upload_id.to_string()),
        ] {
            map.insert(name, value.parse().unwrap());
        }
        map
    }

    fn chunk_post(
        client: &Client,
        base: &str,
        headers: reqwest::header::HeaderMap,
        data: &'static [u8],
    ) -> reqwest::RequestBuilder {
        client
            .post(format!("{base}/api/files/upload-chunk"))
            .headers(headers)
            .body(data)
    }

    #[tokio::test]
    async fn chunked_upload_completes_on_last_chunk() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let client = Client::new();
        let pieces: [&'static [u8]; 3] = [b"alpha-", b"beta-", b"gamma"];

        for (step, index) in [2u32, 0, 1].into_iter().enumerate() {
            let headers = chunk_headers("up-1", index, 3);
            let resp = chunk_post(&client, &base, headers, pieces[index as usize])
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body: ChunkUploadResponse = resp.json().await.unwrap();
            assert!(body.success);
            if step < 2 {
                assert_eq!(body.is_complete, Some(false));
                assert!(body.new_files.is_none());
            } else {
                assert_eq!(body.is_complete, Some(true));
                let files = body.new_files.unwrap();
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].file_name, "résumé 1.txt");
                assert_eq!(files[0].parent_path, "/docs/");
                assert_eq!(body.new_directories.unwrap().len(), 0);
            }
        }

        let on_disk = std::fs::read(dir.path().join("alice/docs/résumé 1.txt")).unwrap();
        assert_eq!(on_disk, b"alpha-beta-gamma");
        assert!(!dir.path().join(".chunks/alice/up-1").exists());
    }

    #[tokio::test]
    async fn incomplete_response_omits_listing_fields() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let resp = chunk_post(&Client::new(), &base, chunk_headers("up-2", 0, 2), b"half")
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body, serde_json::json!({"success": true, "isComplete": false}));
    }

    #[tokio::test]
    async fn missing_owner_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let resp = Client::new()
            .post(format!("{base}/api/files/upload-stream"))
            .header(h::FILE_NAME, "a.txt")
            .body("data")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn traversal_is_rejected_without_disk_changes() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let client = Client::new();

        let cases = [
            (h::PARENT_PATH, "/docs/../../etc/"),
            (h::PARENT_PATH, "docs/"),
            (h::PATH_IN_VIEW, "%2F..%2Fbob%2F"),
            (h::PATH_IN_VIEW, "relative"),
        ];
        for (header_name, value) in cases {
            let mut headers = chunk_headers("up-3", 0, 1);
            headers.insert(header_name, value.parse().unwrap());
            let resp = chunk_post(&client, &base, headers, b"x")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{header_name}: {value}");

            let resp = client
                .post(format!("{base}/api/files/upload-stream"))
                .header(h::OWNER_ID, "alice")
                .header(h::FILE_NAME, "a.txt")
                .header(header_name, value)
                .body("x")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{header_name}: {value}");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn malformed_chunk_headers_are_rejected() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let client = Client::new();

        let mut headers = chunk_headers("up-4", 0, 1);
        headers.insert(h::CHUNK_INDEX, "first".parse().unwrap());
        let resp = chunk_post(&client, &base, headers, b"x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = chunk_post(&client, &base, chunk_headers("up-4", 5, 2), b"x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/api/files/upload-chunk"))
            .header(h::OWNER_ID, "alice")
            .header(h::FILE_NAME, "a.txt")
            .header(h::CHUNK_INDEX, "0")
            .header(h::TOTAL_CHUNKS, "1")
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "missing x-file-id");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn stream_upload_writes_body_and_lists() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();

        let resp = Client::new()
            .post(format!("{base}/api/files/upload-stream"))
            .header(h::OWNER_ID, "alice")
            .header(h::FILE_NAME, "blob.bin")
            .header(h::PARENT_PATH, "/raw/")
            .header(h::PATH_IN_VIEW, "/")
            .body(payload.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: UploadResponse = resp.json().await.unwrap();
        assert!(body.success);
        assert!(body.new_files.is_empty());
        assert_eq!(body.new_directories[0].directory_name, "raw");

        assert_eq!(std::fs::read(dir.path().join("alice/raw/blob.bin")).unwrap(), payload);
    }

    fn form_body(boundary: &str, contents_is_file: bool) -> Vec<u8> {
        let mut body = String::new();
        let fields = [
            ("path_in_view", "/"),
            ("parent_path", "/notes/"),
            ("name", " todo.txt "),
        ];
        for (name, value) in fields {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        if contents_is_file {
            body.push_str(&format!(
                "--{boundary}\r\n\
                 Content-Disposition: form-data; name=\"contents\"; filename=\"todo.txt\"\r\n\
                 Content-Type: text/plain\r\n\r\n"
            ));
        } else {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"contents\"\r\n\r\n"
            ));
        }
        body.push_str("- buy milk\r\n- ship it");
        body.push_str(&format!("\r\n--{boundary}--\r\n"));
        body.into_bytes()
    }

    #[tokio::test]
    async fn form_upload_streams_file_field() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let client = Client::new();

        for contents_is_file in [true, false] {
            let resp = client
                .post(format!("{base}/api/files/upload"))
                .header(h::OWNER_ID, "alice")
                .header(
                    header::CONTENT_TYPE.as_str(),
                    "multipart/form-data; boundary=XyZ123",
                )
                .body(form_body("XyZ123", contents_is_file))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body: UploadResponse = resp.json().await.unwrap();
            assert_eq!(body.new_directories[0].directory_name, "notes");

            let stored = std::fs::read_to_string(dir.path().join("alice/notes/todo.txt")).unwrap();
            assert_eq!(stored, "- buy milk\r\n- ship it");
            std::fs::remove_file(dir.path().join("alice/notes/todo.txt")).unwrap();
        }
    }

    #[tokio::test]
    async fn form_upload_rejects_oversized_value() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;

        let mut body = b"--XyZ123\r\nContent-Disposition: form-data; name=\"path_in_view\"\r\n\r\n"
            .to_vec();
        body.extend(std::iter::repeat_n(b'a', MAX_VALUE_BYTES + 1));
        body.extend_from_slice(b"\r\n--XyZ123--\r\n");

        let resp = Client::new()
            .post(format!("{base}/api/files/upload"))
            .header(h::OWNER_ID, "alice")
            .header(
                header::CONTENT_TYPE.as_str(),
                "multipart/form-data; boundary=XyZ123",
            )
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("path_in_view"), "{body}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn owner_header_is_percent_decoded() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let client = Client::new();

        let resp = client
            .post(format!("{base}/api/files/upload-stream"))
            .header(h::OWNER_ID, "team%2Da")
            .header(h::FILE_NAME, "plan.txt")
            .header(h::PARENT_PATH, "/")
            .body("q3")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(std::fs::read(dir.path().join("team-a/plan.txt")).unwrap(), b"q3");
        assert!(!dir.path().join("team%2Da").exists());

        // An encoded separator decodes into an unsafe owner id.
        let resp = client
            .post(format!("{base}/api/files/upload-stream"))
            .header(h::OWNER_ID, "..%2Fbob")
            .header(h::FILE_NAME, "plan.txt")
            .body("q3")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn form_upload_requires_multipart() {
        let dir = TempDir::new().unwrap();
        let base = spawn_test_server(dir.path()).await;
        let client = Client::new();

        let resp = client
            .post(format!("{base}/api/files/upload"))
            .header(h::OWNER_ID, "alice")
            .header(header::CONTENT_TYPE.as_str(), "application/json")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/api/files/upload"))
            .header(h::OWNER_ID, "alice")
            .header(header::CONTENT_TYPE.as_str(), "multipart/form-data")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
