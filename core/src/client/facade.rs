// Local HTTP facade — the polling surface the UI shell consumes
//
// Thin by design: every endpoint is a direct call into the engine. The
// one exception is /upload_file, which re-POSTs the bytes to the home
// server's file store and then sends the minted URL as a chat.

use std::convert::Infallible;
use std::sync::Arc;

use futures::TryStreamExt;
use hyper::{Body, Method, Request};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use crate::client::engine::{ClientEngine, ClientError};
use crate::client::store::StoredMessage;
use crate::files::{self, MAX_UPLOAD_BYTES};

#[derive(Serialize)]
struct FingerprintResponse {
    fingerprint: String,
    name: String,
    server_address: String,
    server_port: u16,
    http_port: u16,
    public_host: String,
}

#[derive(Serialize)]
struct ClientsResponse {
    clients: Vec<String>,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<StoredMessage>,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    message: String,
    #[serde(default)]
    recipients: Vec<String>,
}

#[derive(Deserialize)]
struct SendPublicMessageRequest {
    message: String,
}

#[derive(Serialize)]
struct UploadFileResponse {
    file_url: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn ok_json<T: Serialize>(value: &T) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

fn error_json(error: &ClientError) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: error.to_string(),
        }),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

/// The facade route tree.
pub fn routes(
    engine: Arc<ClientEngine>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_engine = warp::any().map(move || engine.clone());

    let get_fingerprint = warp::path!("get_fingerprint")
        .and(warp::get())
        .and(with_engine.clone())
        .map(|engine: Arc<ClientEngine>| {
            let cfg = engine.config();
            warp::reply::json(&FingerprintResponse {
                fingerprint: engine.fingerprint().to_string(),
                name: cfg.client_name.clone(),
                server_address: cfg.server_address.clone(),
                server_port: cfg.server_port,
                http_port: cfg.http_port,
                public_host: cfg.server_address.clone(),
            })
        });

    let get_clients = warp::path!("get_clients")
        .and(warp::get())
        .and(with_engine.clone())
        .map(|engine: Arc<ClientEngine>| {
            warp::reply::json(&ClientsResponse {
                clients: engine.known_clients(),
            })
        });

    let request_client_list = warp::path!("request_client_list")
        .and(warp::get())
        .and(with_engine.clone())
        .and_then(handle_request_client_list);

    let get_messages = warp::path!("get_messages")
        .and(warp::get())
        .and(with_engine.clone())
        .map(|engine: Arc<ClientEngine>| {
            warp::reply::json(&MessagesResponse {
                messages: engine.drain_messages(),
            })
        });

    let send_message = warp::path!("send_message")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine.clone())
        .and_then(handle_send_message);

    let send_public_message = warp::path!("send_public_message")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine.clone())
        .and_then(handle_send_public_message);

    let upload_file = warp::path!("upload_file")
        .and(warp::post())
        .and(warp::multipart::form().max_length((MAX_UPLOAD_BYTES + 1024 * 1024) as u64))
        .and(with_engine)
        .and_then(handle_upload_file);

    get_fingerprint
        .or(get_clients)
        .or(request_client_list)
        .or(get_messages)
        .or(send_message)
        .or(send_public_message)
        .or(upload_file)
        .recover(handle_rejection)
}

/// Serve the facade until the process exits.
pub async fn serve(engine: Arc<ClientEngine>) {
    let port = engine.config().facade_port;
    info!(port, "facade listening");
    warp::serve(routes(engine)).run(([0, 0, 0, 0], port)).await;
}

async fn handle_request_client_list(
    engine: Arc<ClientEngine>,
) -> Result<impl Reply, Infallible> {
    Ok(match engine.request_client_list().await {
        Ok(()) => ok_json(&serde_json::json!({})),
        Err(e) => error_json(&e),
    })
}

async fn handle_send_message(
    req: SendMessageRequest,
    engine: Arc<ClientEngine>,
) -> Result<impl Reply, Infallible> {
    Ok(match engine.send_chat(&req.recipients, &req.message).await {
        Ok(()) => ok_json(&StatusResponse { status: "ok" }),
        Err(e) => error_json(&e),
    })
}

async fn handle_send_public_message(
    req: SendPublicMessageRequest,
    engine: Arc<ClientEngine>,
) -> Result<impl Reply, Infallible> {
    Ok(match engine.send_public_chat(&req.message).await {
        Ok(()) => ok_json(&StatusResponse { status: "ok" }),
        Err(e) => error_json(&e),
    })
}

/// Upload the posted file to the home server's file store, then announce
/// the minted URL: to the given recipients as a private chat, or as a
/// public chat when none are named.
async fn handle_upload_file(
    mut form: FormData,
    engine: Arc<ClientEngine>,
) -> Result<impl Reply, Rejection> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut recipients: Vec<String> = Vec::new();

    while let Some(part) = form.try_next().await.map_err(|_| warp::reject())? {
        match part.name() {
            "file" => {
                let name = part
                    .filename()
                    .and_then(files::safe_file_name)
                    .map(str::to_string);
                let Some(name) = name else {
                    return Ok(warp::reply::with_status(
                        warp::reply::json(&ErrorResponse {
                            error: "missing or unsafe filename".into(),
                        }),
                        StatusCode::BAD_REQUEST,
                    ));
                };
                let data = files::read_part(part, MAX_UPLOAD_BYTES).await?;
                file = Some((name, data));
            }
            "recipients" => {
                let raw = files::read_part(part, 64 * 1024).await?;
                let text = String::from_utf8_lossy(&raw);
                recipients = text
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {}
        }
    }

    let Some((name, data)) = file else {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                error: "no file field in request".into(),
            }),
            StatusCode::BAD_REQUEST,
        ));
    };

    let file_url = match upload_to_home_server(&engine, &name, data).await {
        Ok(url) => url,
        Err(e) => {
            warn!("upload to home server failed: {e}");
            return Ok(error_json(&e));
        }
    };

    let body = format!("[File] {file_url}");
    let sent = if recipients.is_empty() {
        engine.send_public_chat(&body).await
    } else {
        engine.send_chat(&recipients, &body).await
    };
    Ok(match sent {
        Ok(()) => ok_json(&UploadFileResponse { file_url }),
        Err(e) => error_json(&e),
    })
}

/// POST the bytes to the home server's `/api/upload` as multipart and
/// return the minted URL.
async fn upload_to_home_server(
    engine: &ClientEngine,
    filename: &str,
    data: Vec<u8>,
) -> Result<String, ClientError> {
    let boundary = format!("olaf-{}", files::mint_file_id());
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let request = Request::builder()
        .method(Method::POST)
        .uri(engine.config().upload_url())
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .map_err(|e| ClientError::Upload(e.to_string()))?;

    let response = hyper::Client::new()
        .request(request)
        .await
        .map_err(|e| ClientError::Upload(e.to_string()))?;
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| ClientError::Upload(e.to_string()))?;
    if !status.is_success() {
        return Err(ClientError::Upload(format!(
            "home server responded {status}"
        )));
    }

    #[derive(Deserialize)]
    struct UploadReply {
        file_url: String,
    }
    let reply: UploadReply = serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::Upload(format!("bad upload response: {e}")))?;
    Ok(reply.file_url)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        Ok(warp::reply::with_status(
            "file exceeds the 10 MiB limit".to_string(),
            StatusCode::PAYLOAD_TOO_LARGE,
        ))
    } else {
        Err(err)
    }
}
