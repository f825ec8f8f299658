//! Google sign-in and the session-held credential bundle.
//!
//! The bundle lives in a signed cookie session. Handlers that need it take a
//! [`SignedIn`] extractor, which copies the bundle out of the session at
//! request time so each job gets its own snapshot.

use std::future::{ready, Ready};

use actix_session::{
    config::PersistentSession, storage::CookieSessionStore, Session, SessionExt, SessionMiddleware,
};
use actix_web::{
    cookie::{time::Duration, Key, SameSite},
    dev::Payload,
    get,
    http::{header::LOCATION, StatusCode},
    post, web, FromRequest, HttpRequest, HttpResponse, Responder, ResponseError,
};
use chrono::Utc;
use oauth2::{
    basic::{BasicClient, BasicErrorResponse, BasicTokenResponse},
    reqwest::async_http_client,
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RequestTokenError,
    Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::validation::ErrorResponse;
use crate::store::CredentialBundle;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CALLBACK_PATH: &str = "/auth/google/callback";

const OAUTH_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/youtube",
];

pub const SESSION_COOKIE: &str = "uploader.sid";
pub const TOKENS_KEY: &str = "tokens";
const STATE_KEY: &str = "oauth_state";
const SESSION_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Not authenticated. Sign in with Google first.")]
    NotAuthenticated,

    #[error("Invalid OAuth state. Please retry sign-in.")]
    InvalidState,

    #[error("Google sign-in is not configured: {0}")]
    NotConfigured(String),

    #[error("Session error: {0}")]
    Session(String),
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            AuthError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            AuthError::InvalidState => StatusCode::BAD_REQUEST,
            AuthError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let AuthError::Session(reason) = self {
            warn!("Session error: {}", reason);
        }
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            fields: serde_json::json!({}),
        })
    }
}

/// OAuth client settings
#[derive(Clone, Debug, Default)]
pub struct GoogleAuth {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Public origin of this server. Derived from each request when unset.
    pub base_url: Option<String>,
}

impl GoogleAuth {
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    /// Callback URL registered with Google for requests arriving as `req`.
    pub fn redirect_uri(&self, req: &HttpRequest) -> String {
        let base = match &self.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => {
                let info = req.connection_info();
                format!("{}://{}", info.scheme(), info.host())
            }
        };
        format!("{}{}", base, CALLBACK_PATH)
    }

    fn client(&self, redirect_uri: String) -> Result<BasicClient, AuthError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(AuthError::NotConfigured(
                "GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET must be set".to_string(),
            ));
        };
        let invalid = |e: oauth2::url::ParseError| AuthError::NotConfigured(e.to_string());

        Ok(BasicClient::new(
            ClientId::new(client_id.clone()),
            Some(ClientSecret::new(client_secret.clone())),
            AuthUrl::new(GOOGLE_AUTH_URL.to_string()).map_err(invalid)?,
            Some(TokenUrl::new(GOOGLE_TOKEN_URL.to_string()).map_err(invalid)?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_uri).map_err(invalid)?))
    }
}

/// Session middleware: signed cookie, lax same-site, seven day lifetime.
pub fn session_middleware(key: Key, secure: bool) -> SessionMiddleware<CookieSessionStore> {
    SessionMiddleware::builder(CookieSessionStore::default(), key)
        .cookie_name(SESSION_COOKIE.to_owned())
        .cookie_same_site(SameSite::Lax)
        .cookie_secure(secure)
        .cookie_http_only(true)
        .session_lifecycle(PersistentSession::default().session_ttl(Duration::days(SESSION_DAYS)))
        .build()
}

fn stored_credential(session: &Session) -> Result<Option<CredentialBundle>, AuthError> {
    session
        .get::<CredentialBundle>(TOKENS_KEY)
        .map_err(|e| AuthError::Session(e.to_string()))
}

/// Credential bundle of the signed-in user. Rejects with 401 otherwise.
pub struct SignedIn(pub CredentialBundle);

impl FromRequest for SignedIn {
    type Error = AuthError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let credential = stored_credential(&req.get_session())
            .and_then(|credential| credential.ok_or(AuthError::NotAuthenticated));
        ready(credential.map(SignedIn))
    }
}

/// Build a bundle from a token grant. Google omits the refresh token on
/// repeat consent, so a previously held one is carried over.
pub fn bundle_from_grant(token: &BasicTokenResponse, previous_refresh: Option<String>) -> CredentialBundle {
    CredentialBundle {
        access_token: token.access_token().secret().clone(),
        refresh_token: token
            .refresh_token()
            .map(|refresh| refresh.secret().clone())
            .or(previous_refresh),
        expires_at: token
            .expires_in()
            .and_then(|lifetime| chrono::Duration::from_std(lifetime).ok())
            .map(|lifetime| Utc::now() + lifetime),
        scope: token.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|scope| scope.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }),
    }
}

fn describe_token_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> String
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => response
            .error_description()
            .cloned()
            .unwrap_or_else(|| response.error().to_string()),
        other => other.to_string(),
    }
}

fn redirect_to(location: String) -> HttpResponse {
    HttpResponse::Found()
        .insert_header((LOCATION, location))
        .finish()
}

#[get("/auth/google")]
async fn start_sign_in(
    req: HttpRequest,
    session: Session,
    auth: web::Data<GoogleAuth>,
) -> Result<HttpResponse, AuthError> {
    let client = auth.client(auth.redirect_uri(&req))?;
    let (authorize_url, state) = client
        .authorize_url(CsrfToken::new_random)
        .add_scopes(OAUTH_SCOPES.iter().map(|scope| Scope::new(scope.to_string())))
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .url();

    session
        .insert(STATE_KEY, state.secret())
        .map_err(|e| AuthError::Session(e.to_string()))?;

    Ok(redirect_to(authorize_url.to_string()))
}

#[derive(Deserialize, Debug)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[get("/auth/google/callback")]
async fn finish_sign_in(
    req: HttpRequest,
    session: Session,
    auth: web::Data<GoogleAuth>,
    query: web::Query<CallbackQuery>,
) -> Result<HttpResponse, AuthError> {
    let expected = session
        .get::<String>(STATE_KEY)
        .map_err(|e| AuthError::Session(e.to_string()))?;
    if expected.is_none() || query.state != expected {
        warn!("OAuth callback with mismatched state");
        return Err(AuthError::InvalidState);
    }
    session.remove(STATE_KEY);

    let CallbackQuery { code, error, .. } = query.into_inner();
    let grant = match (code, error) {
        (_, Some(error)) => Err(error),
        (None, None) => Err("Missing authorization code".to_string()),
        (Some(code), None) => {
            let client = auth.client(auth.redirect_uri(&req))?;
            client
                .exchange_code(AuthorizationCode::new(code))
                .request_async(async_http_client)
                .await
                .map_err(describe_token_error)
        }
    };

    match grant {
        Ok(token) => {
            let previous_refresh = stored_credential(&session)?.and_then(|bundle| bundle.refresh_token);
            let bundle = bundle_from_grant(&token, previous_refresh);
            session
                .insert(TOKENS_KEY, &bundle)
                .map_err(|e| AuthError::Session(e.to_string()))?;
            info!("Signed in with Google");
            Ok(redirect_to("/?auth=success".to_string()))
        }
        Err(message) => {
            warn!("Google sign-in failed: {}", message);
            Ok(redirect_to(format!(
                "/?auth=error&message={}",
                urlencoding::encode(&message)
            )))
        }
    }
}

#[derive(Serialize)]
struct AuthStatus {
    authenticated: bool,
}

#[get("/api/auth/status")]
async fn auth_status(session: Session) -> Result<impl Responder, AuthError> {
    let authenticated = stored_credential(&session)?.is_some();
    Ok(web::Json(AuthStatus { authenticated }))
}

#[post("/api/auth/logout")]
async fn logout(session: Session) -> impl Responder {
    session.purge();
    HttpResponse::Ok().json(serde_json::json!({"ok": true}))
}

/// Registers the sign-in routes. Must be configured before the `/api` scope.
pub fn auth_config(config: &mut web::ServiceConfig) {
    config
        .service(start_sign_in)
        .service(finish_sign_in)
        .service(auth_status)
        .service(logout);
}
