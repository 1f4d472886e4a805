//! Firebase Cloud Messaging (HTTP v1) push notifications.
//!
//! Alerts are delivered to the guardian's phone as high priority Android
//! notifications. Delivery runs on the blocking pool and never stalls the
//! monitor loop; failures are retried a few times and then logged.

use std::{
   collections::BTreeMap,
   env, fs,
   io::Read,
   process::{Command, Stdio},
   sync::Arc,
   time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time};
use wait_timeout::ChildExt;

use crate::{
   backoff::retry_delay,
   config::{PushConfig, TokenSource},
   error::{ChildTagError, Result},
   event::AlertReason,
};

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Lifetime requested for the signed assertion (Google's maximum)
const ASSERTION_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// Delay before the first push retry
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
/// Maximum delay between push retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Cache lifetime for tokens without a reported expiry
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);
/// Refresh this long before a reported expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct SendRequest<'a> {
   message: Message<'a>,
}

#[derive(Serialize)]
struct Message<'a> {
   token: &'a str,
   notification: Notification<'a>,
   android: AndroidConfig,
   data: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
struct Notification<'a> {
   title: &'a str,
   body: &'a str,
}

#[derive(Serialize)]
struct AndroidConfig {
   priority: &'static str,
}

/// The fields of a Google service account key file we need.
#[derive(Deserialize)]
struct ServiceAccountKey {
   client_email: String,
   private_key: String,
   #[serde(default = "default_token_uri")]
   token_uri: String,
}

fn default_token_uri() -> String {
   GOOGLE_TOKEN_URI.to_string()
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
   iss: &'a str,
   scope: &'a str,
   aud: &'a str,
   iat: u64,
   exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
   access_token: String,
   #[serde(default)]
   expires_in: Option<u64>,
}

/// An access token and, when the issuer says so, how long it stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedToken {
   pub token: String,
   pub expires_in: Option<Duration>,
}

impl FetchedToken {
   fn new(token: &str) -> Result<Self> {
      let token = token.trim();
      if token.is_empty() {
         return Err(ChildTagError::AccessToken("token is empty".into()));
      }
      Ok(Self {
         token: token.to_string(),
         expires_in: None,
      })
   }

   /// How long the token may be served from cache.
   fn cache_for(&self) -> Duration {
      match self.expires_in {
         Some(expires_in) => expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN),
         None => TOKEN_TTL,
      }
   }
}

impl TokenSource {
   /// Produces a fresh OAuth access token. Network calls go through `agent`;
   /// a token command is killed after `timeout`.
   pub fn access_token(&self, agent: &ureq::Agent, timeout: Duration) -> Result<FetchedToken> {
      match self {
         Self::ServiceAccount { key_path } => {
            let key = fs::read_to_string(key_path)
               .map_err(|e| ChildTagError::AccessToken(format!("{}: {e}", key_path.display())))?;
            let key: ServiceAccountKey = serde_json::from_str(&key)?;
            exchange_assertion(agent, &key)
         },
         Self::Env { var } => FetchedToken::new(
            &env::var(var).map_err(|e| ChildTagError::AccessToken(format!("${var}: {e}")))?,
         ),
         Self::File { path } => FetchedToken::new(
            &fs::read_to_string(path)
               .map_err(|e| ChildTagError::AccessToken(format!("{}: {e}", path.display())))?,
         ),
         Self::Command { argv } => FetchedToken::new(&run_token_command(argv, timeout)?),
      }
   }
}

/// Signs an RS256 JWT-bearer assertion and trades it for an access token.
fn exchange_assertion(agent: &ureq::Agent, key: &ServiceAccountKey) -> Result<FetchedToken> {
   let iat = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_err(|e| ChildTagError::AccessToken(format!("system clock: {e}")))?
      .as_secs();
   let claims = AssertionClaims {
      iss: &key.client_email,
      scope: FCM_SCOPE,
      aud: &key.token_uri,
      iat,
      exp: iat + ASSERTION_LIFETIME.as_secs(),
   };
   let assertion = jsonwebtoken::encode(
      &Header::new(Algorithm::RS256),
      &claims,
      &EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
   )?;

   let response = agent
      .post(&key.token_uri)
      .send_form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)]);
   let response: TokenResponse = match response {
      Ok(response) => response.into_json()?,
      Err(ureq::Error::Status(status, response)) => {
         return Err(ChildTagError::AccessToken(format!(
            "token exchange for {} failed with {status}: {}",
            key.client_email,
            response.into_string().unwrap_or_default()
         )));
      },
      Err(e) => return Err(e.into()),
   };

   debug!("Obtained access token for {}", key.client_email);
   let mut token = FetchedToken::new(&response.access_token)?;
   token.expires_in = response.expires_in.map(Duration::from_secs);
   Ok(token)
}

/// Runs a token command, returning its stdout. The child is killed after `timeout`.
fn run_token_command(argv: &[String], timeout: Duration) -> Result<String> {
   let (program, args) = argv
      .split_first()
      .ok_or_else(|| ChildTagError::AccessToken("empty token command".into()))?;
   let mut child = Command::new(program)
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()?;

   let Some(status) = child.wait_timeout(timeout)? else {
      child.kill()?;
      child.wait()?;
      return Err(ChildTagError::AccessToken(format!(
         "{program} timed out after {timeout:?}"
      )));
   };

   let mut stdout = String::new();
   if let Some(mut out) = child.stdout.take() {
      out.read_to_string(&mut stdout)?;
   }
   if !status.success() {
      let mut stderr = String::new();
      if let Some(mut err) = child.stderr.take() {
         err.read_to_string(&mut stderr)?;
      }
      return Err(ChildTagError::AccessToken(format!(
         "{program} exited with {status}: {}",
         stderr.trim()
      )));
   }
   Ok(stdout)
}

/// Sends alert notifications. Cheap to clone.
#[derive(Clone)]
pub struct PushSender {
   config: Arc<PushConfig>,
   endpoint: Arc<str>,
   agent: ureq::Agent,
   /// Cached token and when to stop serving it.
   token: Arc<Mutex<Option<(String, Instant)>>>,
}

impl PushSender {
   /// Returns `None` when push is not configured.
   pub fn new(config: &PushConfig) -> Option<Self> {
      if !config.is_enabled() {
         info!("Push notifications disabled (no project id or device token)");
         return None;
      }
      Some(Self::with_endpoint(config, FCM_ENDPOINT))
   }

   fn with_endpoint(config: &PushConfig, endpoint: &str) -> Self {
      let agent = ureq::AgentBuilder::new()
         .timeout(Duration::from_secs(config.timeout_sec))
         .build();
      Self {
         config: Arc::new(config.clone()),
         endpoint: endpoint.trim_end_matches('/').into(),
         agent,
         token: Arc::new(Mutex::new(None)),
      }
   }

   fn access_token(&self) -> Result<String> {
      if let Some((token, expires)) = &*self.token.lock()
         && Instant::now() < *expires
      {
         return Ok(token.clone());
      }
      let fetched = self
         .config
         .token_source
         .access_token(&self.agent, Duration::from_secs(self.config.timeout_sec))?;
      *self.token.lock() = Some((fetched.token.clone(), Instant::now() + fetched.cache_for()));
      Ok(fetched.token)
   }

   fn url(&self) -> String {
      format!(
         "{}/v1/projects/{}/messages:send",
         self.endpoint, self.config.project_id
      )
   }

   fn payload(&self, reason: AlertReason) -> serde_json::Result<serde_json::Value> {
      let request = SendRequest {
         message: Message {
            token: &self.config.device_token,
            notification: Notification {
               title: &self.config.title,
               body: &self.config.body,
            },
            android: AndroidConfig { priority: "high" },
            data: BTreeMap::from([("reason", reason.to_str())]),
         },
      };
      serde_json::to_value(&request)
   }

   /// Performs one delivery attempt on the current thread.
   pub fn send_blocking(&self, reason: AlertReason) -> Result<()> {
      let token = self.access_token()?;
      let payload = self.payload(reason)?;

      let response = self
         .agent
         .post(&self.url())
         .set("Authorization", &format!("Bearer {token}"))
         .set("Content-Type", "application/json")
         .send_json(payload);

      match response {
         Ok(response) => {
            debug!("FCM accepted push ({})", response.status());
            Ok(())
         },
         Err(ureq::Error::Status(status, response)) => {
            if status == 401 {
               // Expired or revoked; fetch a new one next attempt.
               self.token.lock().take();
            }
            Err(ChildTagError::PushRejected {
               status,
               body: response.into_string().unwrap_or_default(),
            })
         },
         Err(e) => Err(e.into()),
      }
   }

   /// Delivers in the background, retrying transient failures.
   pub fn spawn(&self, reason: AlertReason) -> JoinHandle<()> {
      let sender = self.clone();
      tokio::spawn(async move {
         let retries = sender.config.retries;
         for attempt in 0..=retries {
            let this = sender.clone();
            let result = tokio::task::spawn_blocking(move || this.send_blocking(reason))
               .await
               .map_err(ChildTagError::from)
               .and_then(|r| r);

            match result {
               Ok(()) => {
                  info!("Push notification sent ({})", reason.describe());
                  return;
               },
               Err(e) if attempt < retries && is_retryable(&e) => {
                  let delay = retry_delay(attempt, RETRY_BASE_DELAY, MAX_RETRY_DELAY);
                  warn!("Push failed: {e}, retrying in {delay:?}");
                  time::sleep(delay).await;
               },
               Err(e) => {
                  warn!("Push notification failed: {e}");
                  return;
               },
            }
         }
      })
   }
}

/// Client errors other than throttling and expired credentials will not succeed on retry.
fn is_retryable(err: &ChildTagError) -> bool {
   match err {
      ChildTagError::PushRejected { status, .. } => {
         matches!(*status, 401 | 429) || *status >= 500
      },
      ChildTagError::Http(_) | ChildTagError::AccessToken(_) | ChildTagError::Io(_) => true,
      _ => false,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use std::thread;

   use jsonwebtoken::{DecodingKey, Validation};
   use serde_json::json;
   use tempfile::TempDir;
   use tiny_http::{Response, Server};

   const TEST_PRIVATE_KEY: &str = include_str!("testdata/service_account_key.pem");
   const TEST_PUBLIC_KEY: &str = include_str!("testdata/service_account_pub.pem");
   const TEST_CLIENT_EMAIL: &str = "childtag@child-guard.iam.gserviceaccount.com";

   fn push_config(source: TokenSource) -> PushConfig {
      PushConfig {
         project_id: "child-guard".into(),
         device_token: "device-123".into(),
         token_source: source,
         timeout_sec: 5,
         ..PushConfig::default()
      }
   }

   fn agent() -> ureq::Agent {
      ureq::AgentBuilder::new().timeout(Duration::from_secs(5)).build()
   }

   struct Recorded {
      method: String,
      url: String,
      authorization: Option<String>,
      body: String,
   }

   /// Answers a single request with `status` and `reply`, then shuts down.
   fn serve_once(status: u16, reply: &'static str) -> (String, thread::JoinHandle<Recorded>) {
      let server = Server::http("127.0.0.1:0").unwrap();
      let addr = format!("http://{}", server.server_addr().to_ip().unwrap());
      let handle = thread::spawn(move || {
         let mut req = server.recv().unwrap();
         let authorization = req
            .headers()
            .iter()
            .find(|h| h.field.equiv("Authorization"))
            .map(|h| h.value.as_str().to_string());
         let mut body = String::new();
         req.as_reader().read_to_string(&mut body).unwrap();
         let recorded = Recorded {
            method: req.method().to_string(),
            url: req.url().to_string(),
            authorization,
            body,
         };
         req.respond(Response::from_string(reply).with_status_code(status))
            .unwrap();
         recorded
      });
      (addr, handle)
   }

   fn write_service_account(dir: &TempDir, token_uri: &str) -> Result<std::path::PathBuf> {
      let key_path = dir.path().join("service-account.json");
      let key = json!({
         "type": "service_account",
         "project_id": "child-guard",
         "client_email": TEST_CLIENT_EMAIL,
         "private_key": TEST_PRIVATE_KEY,
         "token_uri": token_uri,
      });
      fs::write(&key_path, serde_json::to_string_pretty(&key)?)?;
      Ok(key_path)
   }

   #[test]
   fn test_disabled_without_target() {
      assert!(PushSender::new(&PushConfig::default()).is_none());
      let source = TokenSource::Env {
         var: "UNUSED".into(),
      };
      assert!(PushSender::new(&push_config(source)).is_some());
   }

   #[test]
   fn test_payload_shape() -> Result<()> {
      let source = TokenSource::Env {
         var: "UNUSED".into(),
      };
      let sender = PushSender::with_endpoint(&push_config(source), FCM_ENDPOINT);
      assert_eq!(
         sender.url(),
         "https://fcm.googleapis.com/v1/projects/child-guard/messages:send"
      );

      let payload = sender.payload(AlertReason::SignalLost)?;
      let message = &payload["message"];
      assert_eq!(message["token"], "device-123");
      assert_eq!(message["notification"]["title"], "Emergency alert");
      assert_eq!(message["android"]["priority"], "high");
      assert_eq!(message["data"]["reason"], "signal_lost");
      Ok(())
   }

   #[test]
   fn test_service_account_signs_and_exchanges_assertion() -> Result<()> {
      let (endpoint, server) = serve_once(
         200,
         r#"{"access_token":"ya29.service","expires_in":3599,"token_type":"Bearer"}"#,
      );
      let token_uri = format!("{endpoint}/token");
      let dir = TempDir::new()?;
      let key_path = write_service_account(&dir, &token_uri)?;

      let source = TokenSource::ServiceAccount { key_path };
      let sender = PushSender::with_endpoint(&push_config(source), FCM_ENDPOINT);
      assert_eq!(sender.access_token()?, "ya29.service");

      let request = server.join().unwrap();
      assert_eq!(request.method, "POST");
      assert_eq!(request.url, "/token");
      let form: BTreeMap<&str, &str> = request
         .body
         .split('&')
         .filter_map(|pair| pair.split_once('='))
         .collect();
      assert_eq!(
         form["grant_type"],
         "urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"
      );

      let mut validation = Validation::new(Algorithm::RS256);
      validation.set_audience(&[token_uri.as_str()]);
      let claims = jsonwebtoken::decode::<serde_json::Value>(
         form["assertion"],
         &DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes())?,
         &validation,
      )?
      .claims;
      assert_eq!(claims["iss"], TEST_CLIENT_EMAIL);
      assert_eq!(claims["scope"], FCM_SCOPE);
      assert_eq!(claims["aud"], token_uri.as_str());
      let iat = claims["iat"].as_u64().unwrap();
      assert_eq!(claims["exp"].as_u64().unwrap() - iat, 3600);

      // The token endpoint is gone now, so this must come from the cache.
      assert_eq!(sender.access_token()?, "ya29.service");
      Ok(())
   }

   #[test]
   fn test_service_account_exchange_rejected() -> Result<()> {
      let (endpoint, server) = serve_once(400, r#"{"error":"invalid_grant"}"#);
      let dir = TempDir::new()?;
      let key_path = write_service_account(&dir, &format!("{endpoint}/token"))?;

      let err = TokenSource::ServiceAccount { key_path }
         .access_token(&agent(), Duration::from_secs(5))
         .unwrap_err();
      server.join().unwrap();
      match err {
         ChildTagError::AccessToken(msg) => assert!(msg.contains("invalid_grant"), "{msg}"),
         other => panic!("unexpected error: {other}"),
      }
      Ok(())
   }

   #[test]
   fn test_token_cache_follows_expiry() {
      let token = |expires_in| FetchedToken {
         token: "t".into(),
         expires_in,
      };
      assert_eq!(
         token(Some(Duration::from_secs(3599))).cache_for(),
         Duration::from_secs(3539)
      );
      assert_eq!(token(Some(Duration::from_secs(30))).cache_for(), Duration::ZERO);
      assert_eq!(token(None).cache_for(), TOKEN_TTL);
   }

   #[test]
   fn test_token_from_file_is_trimmed() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("token");
      fs::write(&path, "ya29.token\n")?;

      let token = TokenSource::File { path }.access_token(&agent(), Duration::from_secs(5))?;
      assert_eq!(token.token, "ya29.token");
      assert_eq!(token.expires_in, None);
      Ok(())
   }

   #[test]
   fn test_token_from_command() -> Result<()> {
      let timeout = Duration::from_secs(5);
      let source = TokenSource::Command {
         argv: vec!["echo".into(), "from-command".into()],
      };
      assert_eq!(source.access_token(&agent(), timeout)?.token, "from-command");

      let failing = TokenSource::Command {
         argv: vec!["false".into()],
      };
      assert!(matches!(
         failing.access_token(&agent(), timeout),
         Err(ChildTagError::AccessToken(_))
      ));

      let empty = TokenSource::Command { argv: vec![] };
      assert!(empty.access_token(&agent(), timeout).is_err());
      Ok(())
   }

   #[test]
   fn test_token_command_times_out() {
      let source = TokenSource::Command {
         argv: vec!["sleep".into(), "30".into()],
      };
      let started = Instant::now();
      let result = source.access_token(&agent(), Duration::from_secs(1));

      assert!(started.elapsed() < Duration::from_secs(5));
      match result {
         Err(ChildTagError::AccessToken(msg)) => assert!(msg.contains("timed out"), "{msg}"),
         other => panic!("expected a timeout, got {other:?}"),
      }
   }

   #[test]
   fn test_access_token_is_cached() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("token");
      fs::write(&path, "first")?;

      let sender = PushSender::with_endpoint(
         &push_config(TokenSource::File { path: path.clone() }),
         FCM_ENDPOINT,
      );
      assert_eq!(sender.access_token()?, "first");

      fs::write(&path, "second")?;
      assert_eq!(sender.access_token()?, "first");

      sender.token.lock().take();
      assert_eq!(sender.access_token()?, "second");
      Ok(())
   }

   #[test]
   fn test_missing_env_token() {
      let source = TokenSource::Env {
         var: "CHILDTAG_TEST_TOKEN_THAT_IS_NOT_SET".into(),
      };
      assert!(matches!(
         source.access_token(&agent(), Duration::from_secs(5)),
         Err(ChildTagError::AccessToken(_))
      ));
   }

   #[test]
   fn test_send_posts_bearer_and_json() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("token");
      fs::write(&path, "secret-token")?;

      let (endpoint, server) = serve_once(200, "{}");
      let sender = PushSender::with_endpoint(&push_config(TokenSource::File { path }), &endpoint);
      sender.send_blocking(AlertReason::WeakSignal)?;

      let request = server.join().unwrap();
      assert_eq!(request.method, "POST");
      assert_eq!(request.url, "/v1/projects/child-guard/messages:send");
      assert_eq!(request.authorization.as_deref(), Some("Bearer secret-token"));
      let body: serde_json::Value = serde_json::from_str(&request.body)?;
      assert_eq!(body["message"]["data"]["reason"], "weak_signal");
      Ok(())
   }

   #[test]
   fn test_rejection_is_reported_and_not_retried() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("token");
      fs::write(&path, "secret-token")?;

      let (endpoint, server) = serve_once(404, "{}");
      let sender = PushSender::with_endpoint(&push_config(TokenSource::File { path }), &endpoint);
      let err = sender.send_blocking(AlertReason::Test).unwrap_err();
      server.join().unwrap();

      assert!(matches!(err, ChildTagError::PushRejected { status: 404, .. }));
      assert!(!is_retryable(&err));
      assert!(is_retryable(&ChildTagError::PushRejected {
         status: 503,
         body: String::new()
      }));
      Ok(())
   }

   #[test]
   fn test_unauthorized_drops_cached_token() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("token");
      fs::write(&path, "stale-token")?;

      let (endpoint, server) = serve_once(401, "{}");
      let sender = PushSender::with_endpoint(&push_config(TokenSource::File { path }), &endpoint);
      let err = sender.send_blocking(AlertReason::Test).unwrap_err();
      server.join().unwrap();

      assert!(is_retryable(&err));
      assert!(sender.token.lock().is_none());
      Ok(())
   }
}
