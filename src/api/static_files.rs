use axum::{
    http::{StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
};
use include_dir::{Dir, include_dir};

/// Embedded browser UI build
static DIST_DIR: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/web/dist");

/// Serve static files from the embedded UI build.
///
/// Unknown paths fall back to `index.html` so the SPA router owns them.
pub async fn serve_static(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');

    if let Some(file) = DIST_DIR.get_file(path) {
        return serve_file(file);
    }

    if let Some(index) = DIST_DIR.get_file("index.html") {
        return Html(index.contents()).into_response();
    }

    (StatusCode::NOT_FOUND, "Not found").into_response()
}

/// Serve a specific file with its guessed content type
fn serve_file(file: &include_dir::File<'_>) -> Response {
    let mime = mime_guess::from_path(file.path()).first_or_octet_stream();

    let mut response = file.contents().to_vec().into_response();
    if let Ok(value) = mime.as_ref().parse() {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}
