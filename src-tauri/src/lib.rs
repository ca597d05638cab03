pub mod config;
pub mod logging;

/// Build-time embedded archive key (see `build.rs`).
pub mod key {
    include!(concat!(env!("OUT_DIR"), "/encryption_key.rs"));
}

use anyhow::Context;
use config::{AppConfig, FrontendConfig};
use engine::platform::StdExecutable;
use engine::traits::{CapError, CapResult, ScriptHost};
use engine::{AppContext, ArchiveSource, Decipher, ProtocolConfig, ProtocolHandler, ProtocolResponse};
use tauri::http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode};
use tauri::webview::PageLoadEvent;
use tauri::{Manager, Runtime, WebviewUrl, WebviewWindowBuilder, WindowEvent};

/// Everything the protocol handler and the invoke commands share.
pub struct AppState {
    ctx: AppContext,
}

impl AppState {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let decipher = if cfg.archive.encrypted {
            Some(
                Decipher::new(&key::ENCRYPTION_KEY, cfg.archive.iv.as_bytes())
                    .context("invalid archive cipher settings")?,
            )
        } else {
            None
        };
        let source = match cfg.archive.override_path() {
            Some(path) => ArchiveSource::Path(path),
            None => ArchiveSource::Executable,
        };
        let handler = ProtocolHandler::new(
            ProtocolConfig::from(&cfg.protocol),
            source,
            Box::new(StdExecutable),
            decipher,
        );
        Ok(Self {
            ctx: AppContext::default_platform(handler),
        })
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Answer one custom-scheme request.
    pub fn serve(&self, url: &str) -> ProtocolResponse {
        let response = match self.ctx.protocol() {
            Some(handler) => handler.respond(url),
            None => ProtocolResponse::not_found(),
        };
        if response.is_success() {
            tracing::debug!(url, status = response.status, bytes = response.body.len(), "served");
        } else {
            tracing::warn!(url, status = response.status, "protocol request failed");
        }
        response
    }

    /// The first page the window loads.
    pub fn start_url(&self) -> String {
        self.ctx
            .protocol()
            .map(|p| p.config().url_for(&p.config().entry))
            .unwrap_or_else(|| ProtocolConfig::default().url_for("index.html"))
    }
}

fn to_http(r: ProtocolResponse) -> Response<Vec<u8>> {
    let mut resp = Response::new(r.body);
    *resp.status_mut() = StatusCode::from_u16(r.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(value) = HeaderValue::from_str(&r.mime_type) {
        resp.headers_mut().insert(CONTENT_TYPE, value);
    }
    resp
}

/// Runs binding replies in the calling webview.
struct WebviewScriptHost<'a, R: Runtime>(&'a tauri::Webview<R>);

impl<R: Runtime> ScriptHost for WebviewScriptHost<'_, R> {
    fn execute_script(&self, script: &str) -> CapResult<()> {
        self.0
            .eval(script)
            .map_err(|e| CapError::HostUnavailable(e.to_string()))
    }
}

/// Entry point for `window.muban.<function>(...)` calls from the page.
#[tauri::command]
fn muban_binding<R: Runtime>(
    webview: tauri::Webview<R>,
    state: tauri::State<'_, AppState>,
    name: String,
    args: Vec<serde_json::Value>,
) -> Result<(), String> {
    let ctx = state.context();
    ctx.bindings()
        .invoke(&name, &args, ctx, &WebviewScriptHost(&webview))
        .map_err(|e| {
            tracing::warn!(function = %name, error = %e, "binding call failed");
            e.to_string()
        })
}

#[tauri::command]
fn get_app_config() -> FrontendConfig {
    FrontendConfig::from(config::get_config())
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    logging::init_logging();
    let cfg = config::get_config();

    let state = match AppState::from_config(cfg) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "cannot start");
            std::process::exit(1);
        }
    };
    tracing::info!(
        archive = ?state.context().protocol().and_then(|p| p.archive_location()),
        encrypted = cfg.archive.encrypted,
        "starting"
    );

    tauri::Builder::default()
        .manage(state)
        .register_asynchronous_uri_scheme_protocol(cfg.protocol.scheme.clone(), |ctx, request, responder| {
            let app = ctx.app_handle().clone();
            let url = request.uri().to_string();
            // Archive reads and decryption stay off the event loop.
            std::thread::spawn(move || {
                let response = app.state::<AppState>().serve(&url);
                responder.respond(to_http(response));
            });
        })
        .invoke_handler(tauri::generate_handler![muban_binding, get_app_config])
        .setup(move |app| {
            let (url, init_script) = {
                let state = app.state::<AppState>();
                (state.start_url(), state.context().bindings().init_script())
            };

            let mut builder = WebviewWindowBuilder::new(app, "main", WebviewUrl::CustomProtocol(url.parse()?))
                .title(cfg.window.title.clone())
                .inner_size(cfg.window.width, cfg.window.height)
                .visible(false)
                .initialization_script(&init_script)
                .on_page_load(|window, payload| {
                    if matches!(payload.event(), PageLoadEvent::Finished) {
                        let _ = window.show();
                        let _ = window.set_focus();
                    }
                });
            if cfg.window.center {
                builder = builder.center();
            }
            builder.build()?;
            tracing::debug!(%url, "main window created");
            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::CloseRequested { .. } = event {
                tracing::info!("window closed, exiting");
                window.app_handle().exit(0);
            }
        })
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::archive::ArchiveBuilder;
    use serial_test::serial;

    fn dev_config(archive: &std::path::Path) -> AppConfig {
        let mut cfg = config::get_config().clone();
        cfg.archive.path = archive.display().to_string();
        cfg
    }

    #[test]
    fn test_embedded_key_length() {
        assert_eq!(key::ENCRYPTION_KEY.len(), engine::cipher::KEY_LEN);
    }

    #[test]
    #[serial]
    fn test_state_serves_encrypted_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.asar");

        let cfg = dev_config(&archive);
        let decipher = Decipher::new(&key::ENCRYPTION_KEY, cfg.archive.iv.as_bytes()).unwrap();
        let mut builder = ArchiveBuilder::new().encrypt_with(decipher);
        builder
            .add_file("index.html", b"<h1>hi</h1>".to_vec())
            .unwrap();
        builder.write_to(&archive).unwrap();

        let state = AppState::from_config(&cfg).unwrap();
        let resp = state.serve(&state.start_url());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"<h1>hi</h1>");

        let missing = state.serve("muban://app/nope.js");
        assert_eq!(missing.status, 404);
    }

    #[test]
    #[serial]
    fn test_bad_iv_is_rejected() {
        let mut cfg = config::get_config().clone();
        cfg.archive.iv = "short".into();
        assert!(AppState::from_config(&cfg).is_err());
    }

    #[test]
    fn test_bundled_assets_hold_no_frontend_sources() {
        let conf: serde_json::Value =
            serde_json::from_str(include_str!("../tauri.conf.json")).unwrap();
        let dist = conf["build"]["frontendDist"].as_str().unwrap();
        assert_ne!(dist, "../app");

        let dist = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(dist);
        assert!(dist.join("index.html").is_file());
        for name in ["app.js", "style.css"] {
            assert!(!dist.join(name).exists(), "{} would ship unencrypted", name);
        }
    }

    #[test]
    fn test_to_http() {
        let resp = to_http(ProtocolResponse::not_found());
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
