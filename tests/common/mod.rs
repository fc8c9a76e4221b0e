#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use deskgate::api::{self, AppState, RouterConfig};
use deskgate::collab::{
    CloseOutcome, CollaboratorError, Collaborators, Notification, Notifier, ScreenProvider,
    Screenshot, WindowCloser, WindowInfo,
};
use deskgate::server::{ControlServer, StatusHandle};
use deskgate::token::TokenStore;

pub const TOKEN: &str = "ABC-123";

/// Records every notification it is asked to show.
#[derive(Default)]
pub struct RecordingNotifier {
    pub shown: Mutex<Vec<Notification>>,
}

impl Notifier for RecordingNotifier {
    fn show_notification(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        self.shown.lock().push(notification.clone());
        Ok(())
    }
}

/// In-memory desktop: a fixed window list, and a close primitive that
/// records what it was asked to close.
pub struct FakeDesktop {
    pub windows: Vec<WindowInfo>,
    pub closed: Mutex<Vec<(u64, bool)>>,
}

impl FakeDesktop {
    pub fn new(windows: Vec<WindowInfo>) -> Arc<Self> {
        Arc::new(Self {
            windows,
            closed: Mutex::new(Vec::new()),
        })
    }

    pub fn closed_handles(&self) -> Vec<u64> {
        self.closed.lock().iter().map(|(h, _)| *h).collect()
    }
}

impl ScreenProvider for FakeDesktop {
    fn capture_screen(&self) -> Result<Screenshot, CollaboratorError> {
        Ok(Screenshot::png(b"\x89PNG fake screen".to_vec()))
    }

    fn capture_window(&self, handle: u64) -> Result<Screenshot, CollaboratorError> {
        if self.windows.iter().any(|w| w.handle == handle) {
            Ok(Screenshot::png(format!("\x7fPNG window {handle}").into_bytes()))
        } else {
            Err(CollaboratorError::Failed(format!("no window {handle}")))
        }
    }

    fn list_windows(&self) -> Result<Vec<WindowInfo>, CollaboratorError> {
        Ok(self.windows.clone())
    }
}

impl WindowCloser for FakeDesktop {
    fn close_window(&self, handle: u64, force: bool) -> Result<CloseOutcome, CollaboratorError> {
        self.closed.lock().push((handle, force));
        let window = self.windows.iter().find(|w| w.handle == handle);
        Ok(CloseOutcome {
            ok: window.is_some(),
            title: window.map(|w| w.title.clone()).unwrap_or_default(),
            process_name: window.map(|w| w.process_name.clone()).unwrap_or_default(),
            method: if force { "terminate" } else { "close message" }.to_string(),
        })
    }
}

pub fn window(handle: u64, title: &str, process_name: &str) -> WindowInfo {
    WindowInfo {
        handle,
        title: title.into(),
        process_name: process_name.into(),
        process_id: Some(4242),
        system_critical: false,
    }
}

/// A desktop with two game windows, an editor, a critical shell window and
/// a window owned by the test process itself.
pub fn sample_desktop() -> Arc<FakeDesktop> {
    let mut shell = window(30, "Taskbar", "explorer");
    shell.system_critical = true;
    let mut own = window(40, "deskgate console", "deskgate");
    own.process_id = Some(std::process::id());
    FakeDesktop::new(vec![
        window(10, "Space Game", "game"),
        window(11, "game launcher", "launcher"),
        window(20, "Notes - Editor", "editor"),
        shell,
        own,
    ])
}

pub struct TestEnv {
    pub state: AppState,
    pub notifier: Arc<RecordingNotifier>,
    pub desktop: Arc<FakeDesktop>,
}

/// State with every collaborator faked and [`TOKEN`] configured.
pub fn test_env() -> TestEnv {
    let tokens = Arc::new(TokenStore::in_memory());
    tokens.set_token(TOKEN).unwrap();
    test_env_with(tokens)
}

pub fn test_env_with(tokens: Arc<TokenStore>) -> TestEnv {
    let notifier = Arc::new(RecordingNotifier::default());
    let desktop = sample_desktop();
    let collaborators = Collaborators {
        notifier: Some(notifier.clone()),
        schedule: None,
        screen: Some(desktop.clone()),
        closer: Some(desktop.clone()),
    };
    let state = AppState::new(tokens, collaborators, StatusHandle::new(0));
    TestEnv {
        state,
        notifier,
        desktop,
    }
}

/// Start a real server on an ephemeral port.
pub async fn spawn_server(state: AppState) -> (Arc<ControlServer>, SocketAddr) {
    let status = state.server.clone();
    let app = api::router(state, RouterConfig::default());
    let server = Arc::new(ControlServer::new(app, status));
    let addr = server.start().await.unwrap();
    (server, addr)
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", addr.port(), path)
}

/// `session=...` from a `Set-Cookie` response header.
pub fn session_cookie(response: &reqwest::Response) -> String {
    let raw = response
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .expect("response should set a cookie")
        .to_str()
        .unwrap();
    raw.split(';').next().unwrap().to_string()
}

/// Log in with [`TOKEN`] and return the session cookie.
pub async fn login(client: &reqwest::Client, addr: SocketAddr) -> String {
    let response = client
        .post(url(addr, "/api/login"))
        .json(&serde_json::json!({ "token": TOKEN }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    session_cookie(&response)
}
