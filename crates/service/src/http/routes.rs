//! Per-request dispatch: parses method+path, reads the body, calls into the
//! engine, and writes a `tiny_http::Response` back — buffered or streamed
//! depending on what the engine returned.

use std::io::{Cursor, Read};

use serde_json::{json, Value};
use tiny_http::{Header, Method, Request, Response, StatusCode};

use crate::engine::{self, EngineBody, EngineResponse};

use super::models;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

fn read_body(request: &mut Request) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    let mut chunk = [0u8; 8192];
    let reader = request.as_reader();
    loop {
        let read = reader.read(&mut chunk).map_err(|err| err.to_string())?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_BODY_BYTES {
            return Err(format!("request body too large: >{MAX_BODY_BYTES} bytes"));
        }
    }
    Ok(body)
}

fn json_response(status: u16, value: &Value) -> Response<Cursor<Vec<u8>>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let len = Some(body.len());
    let header = Header::from_bytes(b"Content-Type".as_slice(), b"application/json".as_slice()).expect("static header");
    Response::new(StatusCode(status), vec![header], Cursor::new(body), len, None)
}

fn error_response(status: u16, message: impl Into<String>) -> Response<Cursor<Vec<u8>>> {
    json_response(status, &json!({"error": {"message": message.into()}}))
}

fn respond_engine(request: Request, result: EngineResponse) {
    let header = Header::from_bytes(b"Content-Type".as_slice(), result.content_type.as_bytes()).expect("static header");
    match result.body {
        EngineBody::Bytes(bytes) => {
            let len = Some(bytes.len());
            let response = Response::new(StatusCode(result.status), vec![header], Cursor::new(bytes), len, None);
            let _ = request.respond(response);
        }
        EngineBody::Stream(reader) => {
            let response = Response::new(StatusCode(result.status), vec![header], reader, None, None);
            let _ = request.respond(response);
        }
    }
}

fn handle_chat_or_responses(mut request: Request, path: &str) {
    let body = match read_body(&mut request) {
        Ok(body) => body,
        Err(message) => {
            let _ = request.respond(error_response(413, message));
            return;
        }
    };
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let _ = request.respond(error_response(400, format!("invalid JSON body: {err}")));
            return;
        }
    };
    let result = engine::forward(path, parsed);
    respond_engine(request, result);
}

fn handle_models_list(request: Request) {
    let _ = request.respond(json_response(200, &models::list_models()));
}

fn handle_model_get(request: Request, id: &str) {
    match models::find_model(id) {
        Some(model) => {
            let _ = request.respond(json_response(200, &model));
        }
        None => {
            let _ = request.respond(error_response(404, format!("unknown model: {id}")));
        }
    }
}

fn method_str(method: &Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        _ => "OTHER",
    }
}

/// Dispatches one accepted connection; every branch calls `respond` exactly
/// once, so the request is always consumed.
pub(super) fn handle(request: Request) {
    let method = method_str(request.method());
    let path = request.url().split('?').next().unwrap_or("").to_string();

    match (method, path.as_str()) {
        ("POST", "/v1/chat/completions") => handle_chat_or_responses(request, &path),
        ("POST", "/v1/responses") => handle_chat_or_responses(request, &path),
        ("GET", "/v1/models") => handle_models_list(request),
        ("GET", other) if other.starts_with("/v1/models/") => {
            let id = other.trim_start_matches("/v1/models/").to_string();
            handle_model_get(request, &id);
        }
        _ => {
            let _ = request.respond(error_response(404, "not found"));
        }
    }
}
