//! Axum + Askama interactive UI for Greylit: password gate, tiered search
//! form, per-site results, CSV export, save-to-store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use greylit_core::{ResultItem, SearchQueryTier, SearchRun, SiteResultSet, UpsertStats};
use greylit_search::{parse_site_list, Accumulator, CseClient, CseConfig};
use greylit_store::{AirtableClient, AirtableConfig, UpsertClient, UpsertOptions, WRITE_DELAY};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "greylit-web";

const SESSION_COOKIE: &str = "greylit_session";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub password: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            password: std::env::var("GREYLIT_APP_PASSWORD").unwrap_or_default(),
            port: std::env::var("GREYLIT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// All per-process state: the configured clients plus the current run held in
/// memory for the interactive session.
pub struct AppState {
    password: String,
    sessions: Mutex<HashSet<String>>,
    current_run: Mutex<Option<SearchRun>>,
    notice: Mutex<Option<String>>,
    search: Option<CseClient>,
    store: Option<AirtableClient>,
}

impl AppState {
    pub fn from_env(config: &WebConfig) -> anyhow::Result<Self> {
        let cse = CseConfig::from_env();
        let search = if cse.credentials.is_empty() {
            None
        } else {
            Some(CseClient::new(cse)?)
        };
        let airtable = AirtableConfig::from_env();
        let store = if airtable.is_configured() {
            Some(AirtableClient::new(airtable)?)
        } else {
            None
        };
        Ok(Self::new(&config.password, search, store))
    }

    pub fn new(password: &str, search: Option<CseClient>, store: Option<AirtableClient>) -> Self {
        Self {
            password: password.to_string(),
            sessions: Mutex::new(HashSet::new()),
            current_run: Mutex::new(None),
            notice: Mutex::new(None),
            search,
            store,
        }
    }

    fn set_notice(&self, text: impl Into<String>) {
        *self.notice.lock().expect("notice lock") = Some(text.into());
    }

    fn take_notice(&self) -> Option<String> {
        self.notice.lock().expect("notice lock").take()
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_page_handler).post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/search", post(search_handler))
        .route("/save", post(save_handler))
        .route("/sites/{index}/results.csv", get(site_csv_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    if config.password.is_empty() {
        anyhow::bail!("GREYLIT_APP_PASSWORD is not set; refusing to serve without a password");
    }
    let state = Arc::new(AppState::from_env(&config)?);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "greylit web ui listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    error: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    search_configured: bool,
    store_configured: bool,
    limit_exceeded: bool,
    total_results: usize,
    has_results: bool,
    notice: Option<String>,
    sites: Vec<SiteView>,
}

struct SiteView {
    index: usize,
    site: String,
    query_label: String,
    count: usize,
    items: Vec<ResultItem>,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize, Default)]
struct SearchForm {
    #[serde(default)]
    and1: String,
    #[serde(default)]
    exact1: String,
    #[serde(default)]
    any1: String,
    #[serde(default)]
    none1: String,
    #[serde(default)]
    and2: String,
    #[serde(default)]
    exact2: String,
    #[serde(default)]
    any2: String,
    #[serde(default)]
    none2: String,
    #[serde(default)]
    and3: String,
    #[serde(default)]
    exact3: String,
    #[serde(default)]
    any3: String,
    #[serde(default)]
    none3: String,
    #[serde(default)]
    websites: String,
}

impl SearchForm {
    fn tiers(&self) -> [SearchQueryTier; 3] {
        [
            SearchQueryTier {
                all_terms: self.and1.clone(),
                exact_phrase: self.exact1.clone(),
                any_terms: self.any1.clone(),
                none_terms: self.none1.clone(),
            },
            SearchQueryTier {
                all_terms: self.and2.clone(),
                exact_phrase: self.exact2.clone(),
                any_terms: self.any2.clone(),
                none_terms: self.none2.clone(),
            },
            SearchQueryTier {
                all_terms: self.and3.clone(),
                exact_phrase: self.exact3.clone(),
                any_terms: self.any3.clone(),
                none_terms: self.none3.clone(),
            },
        ]
    }
}

#[derive(Debug, Deserialize, Default)]
struct SaveForm {
    #[serde(default)]
    check_duplicates: Option<String>,
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

fn is_authenticated(state: &AppState, headers: &HeaderMap) -> bool {
    session_token(headers)
        .map(|token| state.sessions.lock().expect("session lock").contains(&token))
        .unwrap_or(false)
}

async fn index_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !is_authenticated(&state, &headers) {
        return Redirect::to("/login").into_response();
    }

    let run = state.current_run.lock().expect("run lock").clone();
    let (sites, limit_exceeded, total_results) = match &run {
        Some(run) => (
            run.sites
                .iter()
                .enumerate()
                .map(|(index, set)| SiteView {
                    index,
                    site: set.site.clone(),
                    query_label: set.query_label.clone(),
                    count: set.items.len(),
                    items: set.items.clone(),
                })
                .collect(),
            run.limit_exceeded,
            run.total_results(),
        ),
        None => (Vec::new(), false, 0),
    };

    render_html(IndexTemplate {
        search_configured: state.search.is_some(),
        store_configured: state.store.is_some(),
        limit_exceeded,
        total_results,
        has_results: run.is_some(),
        notice: state.take_notice(),
        sites,
    })
}

async fn login_page_handler() -> Response {
    render_html(LoginTemplate { error: false })
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    if state.password.is_empty() || form.password != state.password {
        return render_html(LoginTemplate { error: true });
    }

    let token = Uuid::new_v4().to_string();
    state
        .sessions
        .lock()
        .expect("session lock")
        .insert(token.clone());
    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
    ([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response()
}

async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.sessions.lock().expect("session lock").remove(&token);
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0");
    ([(header::SET_COOKIE, cookie)], Redirect::to("/login")).into_response()
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<SearchForm>,
) -> Response {
    if !is_authenticated(&state, &headers) {
        return Redirect::to("/login").into_response();
    }
    let Some(client) = &state.search else {
        state.set_notice("Search credentials are not configured; set GREYLIT_CSE_KEYS and GREYLIT_CSE_CX.");
        return Redirect::to("/").into_response();
    };

    let sites = parse_site_list(&form.websites);
    let run = Accumulator::new(client).run(&sites, &form.tiers()).await;
    info!(
        run_id = %run.run_id,
        sites = run.sites.len(),
        results = run.total_results(),
        limit_exceeded = run.limit_exceeded,
        "search run finished"
    );
    *state.current_run.lock().expect("run lock") = Some(run);
    Redirect::to("/").into_response()
}

async fn save_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<SaveForm>,
) -> Response {
    if !is_authenticated(&state, &headers) {
        return Redirect::to("/login").into_response();
    }
    let Some(store) = &state.store else {
        state.set_notice("Store is not configured; set AIRTABLE_TOKEN and AIRTABLE_BASE_ID.");
        return Redirect::to("/").into_response();
    };
    let results: Option<Vec<SiteResultSet>> = {
        let run = state.current_run.lock().expect("run lock");
        run.as_ref().map(|run| run.sites.clone())
    };
    let Some(results) = results else {
        state.set_notice("No search results to save yet.");
        return Redirect::to("/").into_response();
    };

    let options = UpsertOptions {
        verify_duplicates: form.check_duplicates.is_some(),
        write_delay: WRITE_DELAY,
    };
    let stats = UpsertClient::new(store, options)
        .save_results(&results, |progress| {
            debug!(
                processed = progress.processed,
                total = progress.total,
                created = progress.created,
                errors = progress.errors,
                "upsert progress"
            );
        })
        .await;
    state.set_notice(save_summary(&stats));
    Redirect::to("/").into_response()
}

fn save_summary(stats: &UpsertStats) -> String {
    format!(
        "Save complete: {} created, {} duplicates skipped, {} errors ({} processed).",
        stats.created, stats.duplicates, stats.errors, stats.processed
    )
}

async fn site_csv_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(index): AxumPath<usize>,
) -> Response {
    if !is_authenticated(&state, &headers) {
        return Redirect::to("/login").into_response();
    }
    let run = state.current_run.lock().expect("run lock");
    let Some(set) = run.as_ref().and_then(|run| run.sites.get(index)) else {
        return (StatusCode::NOT_FOUND, Html("No such result set".to_string())).into_response();
    };

    let filename = format!("{}_results.csv", set.site.replace('.', "_"));
    let body = site_csv(set);
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn site_csv(set: &SiteResultSet) -> String {
    let mut out = String::from("title,link,snippet,priority\n");
    for item in &set.items {
        out.push_str(&format!(
            "{},{},{},{}\n",
            csv_field(&item.title),
            csv_field(&item.link),
            csv_field(&item.snippet),
            item.priority
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_html<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(error) => {
            warn!(error = %error, "template render failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Server error: {error}")),
            )
                .into_response()
        }
    }
}
