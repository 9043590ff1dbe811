// HTTP file store — bounded uploads, URL minting, key drop-off
//
// POST /api/upload   multipart, 10 MiB cap, returns {"file_url": ...}
// GET  /files/<id>/<name>
// GET  /pub          this server's public key PEM
// POST /upload_key   multipart, writes <host>_<port>_public_key.pem
//                    atomically into the neighbours directory

use std::sync::Arc;

use bytes::Buf;
use futures::TryStreamExt;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::{Filter, Rejection, Reply};

use crate::crypto;
use crate::relay::Relay;

/// Upload size cap: 10 MiB.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Key drop-offs are a single PEM; anything bigger is garbage.
const MAX_KEY_BYTES: usize = 16 * 1024;
/// Length of minted file identifiers.
const FILE_ID_LEN: usize = 32;

#[derive(Debug)]
struct FileTooLarge;
impl warp::reject::Reject for FileTooLarge {}

#[derive(Debug)]
struct BadUpload(&'static str);
impl warp::reject::Reject for BadUpload {}

#[derive(Debug)]
struct StorageFailure;
impl warp::reject::Reject for StorageFailure {}

#[derive(Serialize)]
struct UploadResponse {
    file_url: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

/// Mint a URL-safe random file identifier.
pub fn mint_file_id() -> String {
    (&mut OsRng)
        .sample_iter(Alphanumeric)
        .take(FILE_ID_LEN)
        .map(char::from)
        .collect()
}

/// A bare file name: no path separators, no traversal.
pub fn safe_file_name(name: &str) -> Option<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        None
    } else {
        Some(name)
    }
}

/// Validate an uploaded key file name: `<host>_<port>_public_key.pem`.
pub fn valid_key_file_name(name: &str) -> bool {
    let Some(host_port) = name.strip_suffix("_public_key.pem") else {
        return false;
    };
    let Some((host, port)) = host_port.rsplit_once('_') else {
        return false;
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && port.parse::<u16>().is_ok()
}

/// The warp route tree for the file store.
pub fn routes(
    relay: Arc<Relay>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_relay = {
        let relay = relay.clone();
        warp::any().map(move || relay.clone())
    };

    let upload = warp::path!("api" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length((MAX_UPLOAD_BYTES + 1024 * 1024) as u64))
        .and(with_relay.clone())
        .and_then(handle_upload);

    let download = warp::path("files").and(warp::fs::dir(relay.config().files_dir.clone()));

    let public_key = {
        let pem = relay.identity().public_key_pem().to_string();
        warp::path!("pub").and(warp::get()).map(move || {
            warp::reply::with_header(pem.clone(), "content-type", "application/x-pem-file")
        })
    };

    let upload_key = warp::path!("upload_key")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_KEY_BYTES as u64))
        .and(with_relay)
        .and_then(handle_upload_key);

    upload
        .or(download)
        .or(public_key)
        .or(upload_key)
        .recover(handle_rejection)
}

/// Serve the file store on the configured HTTP port.
pub async fn serve(relay: Arc<Relay>) {
    let addr = (relay.bind_ip(), relay.config().http_port);
    warp::serve(routes(relay)).run(addr).await;
}

/// Drain a multipart part into memory, enforcing `cap`.
pub(crate) async fn read_part(part: Part, cap: usize) -> Result<Vec<u8>, Rejection> {
    let mut data = Vec::new();
    let mut stream = part.stream();
    while let Some(mut buf) = stream
        .try_next()
        .await
        .map_err(|_| warp::reject::custom(BadUpload("unreadable multipart body")))?
    {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            if data.len() + chunk.len() > cap {
                return Err(warp::reject::custom(FileTooLarge));
            }
            data.extend_from_slice(chunk);
            let consumed = chunk.len();
            buf.advance(consumed);
        }
    }
    Ok(data)
}

/// Pull the `file` field out of a multipart form.
async fn file_field(mut form: FormData, cap: usize) -> Result<(String, Vec<u8>), Rejection> {
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|_| warp::reject::custom(BadUpload("unreadable multipart form")))?
    {
        if part.name() != "file" {
            continue;
        }
        let name = part
            .filename()
            .and_then(safe_file_name)
            .ok_or_else(|| warp::reject::custom(BadUpload("missing or unsafe filename")))?
            .to_string();
        let data = read_part(part, cap).await?;
        return Ok((name, data));
    }
    Err(warp::reject::custom(BadUpload("no file field in request")))
}

async fn handle_upload(form: FormData, relay: Arc<Relay>) -> Result<impl Reply, Rejection> {
    let (name, data) = file_field(form, MAX_UPLOAD_BYTES).await?;

    let id = mint_file_id();
    let dir = relay.config().files_dir.join(&id);
    let write = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&name), &data).await
    };
    if let Err(e) = write.await {
        warn!(file = %name, "upload write failed: {e}");
        return Err(warp::reject::custom(StorageFailure));
    }

    let file_url = format!(
        "http://{}:{}/files/{}/{}",
        relay.config().external_address,
        relay.config().http_port,
        id,
        name
    );
    info!(file = %name, bytes = data.len(), "stored upload");
    Ok(warp::reply::json(&UploadResponse { file_url }))
}

async fn handle_upload_key(form: FormData, relay: Arc<Relay>) -> Result<impl Reply, Rejection> {
    let (name, data) = file_field(form, MAX_KEY_BYTES).await?;
    if !valid_key_file_name(&name) {
        return Err(warp::reject::custom(BadUpload(
            "key file must be named <host>_<port>_public_key.pem",
        )));
    }
    let pem = String::from_utf8(data)
        .map_err(|_| warp::reject::custom(BadUpload("key file is not UTF-8")))?;
    crypto::public_key_from_pem(&pem)
        .map_err(|_| warp::reject::custom(BadUpload("key file is not a public key PEM")))?;

    // Write-then-rename so the registry never reads a half-written key.
    let dir = &relay.config().neighbours_dir;
    let tmp = dir.join(format!(".tmp-{}", mint_file_id()));
    let finalize = async {
        tokio::fs::write(&tmp, &pem).await?;
        tokio::fs::rename(&tmp, dir.join(&name)).await
    };
    if let Err(e) = finalize.await {
        warn!(key = %name, "key write failed: {e}");
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(warp::reject::custom(StorageFailure));
    }
    info!(key = %name, "neighbour key registered");
    Ok(warp::reply::json(&StatusResponse { status: "ok" }))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if err.find::<FileTooLarge>().is_some() || err.find::<warp::reject::PayloadTooLarge>().is_some()
    {
        Ok(warp::reply::with_status(
            "file exceeds the 10 MiB limit".to_string(),
            StatusCode::PAYLOAD_TOO_LARGE,
        ))
    } else if let Some(bad) = err.find::<BadUpload>() {
        Ok(warp::reply::with_status(
            bad.0.to_string(),
            StatusCode::BAD_REQUEST,
        ))
    } else if err.find::<StorageFailure>().is_some() {
        Ok(warp::reply::with_status(
            "storage failure".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        ))
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_file_id_shape() {
        let id = mint_file_id();
        assert_eq!(id.len(), FILE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(mint_file_id(), id);
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("report.pdf"), Some("report.pdf"));
        assert_eq!(safe_file_name("with space.txt"), Some("with space.txt"));
        assert!(safe_file_name("").is_none());
        assert!(safe_file_name("..").is_none());
        assert!(safe_file_name("../../etc/passwd").is_none());
        assert!(safe_file_name("dir/inner.txt").is_none());
        assert!(safe_file_name("win\\style").is_none());
    }

    #[test]
    fn test_valid_key_file_name() {
        assert!(valid_key_file_name("server2_8766_public_key.pem"));
        assert!(valid_key_file_name("10.0.0.7_9000_public_key.pem"));
        assert!(!valid_key_file_name("server2_8766.pem"));
        assert!(!valid_key_file_name("_8766_public_key.pem"));
        assert!(!valid_key_file_name("server2_notaport_public_key.pem"));
        assert!(!valid_key_file_name("../evil_8766_public_key.pem"));
    }
}
