use crate::config::Config;
use crate::consent::{Consent, CookiePolicy};
use crate::errors::{AssignerError, Result};
use crate::experiment::{Experiment, TestName};
use crate::identity::IdentityResolver;
use crate::metrics_defs::{
    ASSIGNMENTS, ASSIGNMENTS_REJECTED, CONSENT_CHANGES, REQUEST_DURATION, REQUESTS_INFLIGHT,
};
use crate::record::Assignments;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN, SET_COOKIE, VARY,
};
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use shared::http::{PeerAddr, full_body, make_boxed_error_response};
use shared::{counter, gauge, histogram};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

const ASSIGN_PATH: &str = "/assign";
const TEST_PARAM: &str = "test";
const CONSENT_PARAM: &str = "consent";

type AssignerResponse = Response<BoxBody<Bytes, AssignerError>>;

/// Body of a successful `GET /assign`
#[derive(Debug, Default, Serialize)]
pub struct AssignResponse {
    /// Selected variant per requested test
    pub assignments: BTreeMap<String, String>,
    /// Records to attach to the tracked event
    pub ab: Assignments,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Serves variant assignments for the configured experiments.
#[derive(Clone)]
pub struct AssignerService {
    experiments: Arc<BTreeMap<TestName, Experiment>>,
    identity: IdentityResolver,
    cookies: CookiePolicy,
    cors_origins: Arc<Vec<String>>,
}

impl AssignerService {
    pub fn new(config: &Config) -> Self {
        AssignerService {
            experiments: Arc::new(config.experiments()),
            identity: IdentityResolver::new(
                config.hash_cookie_name.clone(),
                config.salt.build(),
                config.trust_forwarded_for,
            ),
            cookies: CookiePolicy::new(
                config.hash_cookie_name.clone(),
                config.client_id_cookie_name.clone(),
                config.cookie_domain.clone(),
            ),
            cors_origins: Arc::new(config.cors_origins.clone()),
        }
    }

    /// Routes a request and builds the response, errors included.
    pub fn handle<B>(&self, req: &Request<B>) -> AssignerResponse {
        let mut response = match (req.method(), req.uri().path()) {
            (&Method::OPTIONS, ASSIGN_PATH) => {
                let mut response = Response::new(full_body(Bytes::new()));
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            (&Method::GET, ASSIGN_PATH) => match self.assign(req) {
                Ok((body, cookies)) => {
                    let mut response = json_response(StatusCode::OK, &body);
                    for cookie in cookies {
                        match HeaderValue::from_str(&cookie) {
                            Ok(value) => {
                                response.headers_mut().append(SET_COOKIE, value);
                            }
                            Err(e) => tracing::warn!(error = %e, "Dropped invalid cookie"),
                        }
                    }
                    response
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Rejected assignment request");
                    counter!(ASSIGNMENTS_REJECTED, "reason" => e.reason()).increment(1);
                    json_response(e.status_code(), &ErrorBody {
                        error: e.to_string(),
                    })
                }
            },
            (_, ASSIGN_PATH) => make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED),
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        };

        self.add_cors_headers(req.headers(), response.headers_mut());
        response
    }

    /// Assigns every requested test and returns the `Set-Cookie` values of
    /// a consent change, if the request carries one.
    fn assign<B>(&self, req: &Request<B>) -> Result<(AssignResponse, Vec<String>)> {
        let query = AssignQuery::parse(req.uri().query().unwrap_or_default());
        let consent = query
            .consent
            .as_deref()
            .map(str::parse::<Consent>)
            .transpose()?;
        if query.tests.is_empty() && consent.is_none() {
            return Err(AssignerError::MissingTestParameter);
        }

        // Validate everything before hashing anything
        let experiments = query
            .tests
            .into_iter()
            .map(|test| {
                let name = TestName::new(test)?;
                self.experiments
                    .get(name.as_str())
                    .ok_or_else(|| AssignerError::UnknownExperiment(name.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let peer = req.extensions().get::<PeerAddr>().map(|peer| peer.0);
        // A revoked hash cookie no longer identifies the visitor
        let identity = match consent {
            Some(Consent::Revoked) => self.identity.derive(req.headers(), peer),
            _ => self.identity.resolve(req.headers(), peer),
        }
        .ok_or(AssignerError::MissingIdentity)?;

        let mut body = AssignResponse::default();
        for experiment in experiments {
            let record = experiment.assign(&identity);
            tracing::debug!(test = %record.name, variant = %record.variant, "Assigned variant");
            counter!(
                ASSIGNMENTS,
                "test" => record.name.clone(),
                "variant" => record.variant.clone()
            )
            .increment(1);

            body.assignments
                .insert(record.name.clone(), record.variant.clone());
            body.ab.push(record);
        }

        let cookies = match consent {
            Some(consent) => {
                tracing::debug!(consent = consent.as_str(), "Applying consent change");
                counter!(CONSENT_CHANGES, "consent" => consent.as_str()).increment(1);
                self.cookies.set_cookies(consent, req.headers(), &identity)
            }
            None => Vec::new(),
        };

        Ok((body, cookies))
    }

    fn add_cors_headers(&self, request_headers: &HeaderMap, headers: &mut HeaderMap) {
        let Some(origin) = request_headers.get(ORIGIN) else {
            return;
        };
        let allowed = origin
            .to_str()
            .is_ok_and(|origin| self.cors_origins.iter().any(|allowed| allowed == origin));
        if !allowed {
            return;
        }

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET,OPTIONS"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type,Authorization"),
        );
        headers.insert(VARY, HeaderValue::from_static("Origin"));
    }
}

impl Service<Request<Incoming>> for AssignerService {
    type Response = AssignerResponse;
    type Error = AssignerError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        let start = Instant::now();

        let response = self.handle(&req);

        histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_owned())
            .record(start.elapsed().as_secs_f64());
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);

        Box::pin(async move { Ok(response) })
    }
}

/// Query parameters of `GET /assign`.
#[derive(Debug, Default, PartialEq)]
struct AssignQuery {
    /// Distinct `test` parameters, in request order
    tests: Vec<String>,
    /// First `consent` parameter
    consent: Option<String>,
}

impl AssignQuery {
    fn parse(query: &str) -> Self {
        let mut parsed = AssignQuery::default();
        let mut seen: HashSet<Cow<'_, str>> = HashSet::new();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                TEST_PARAM => {
                    if seen.insert(value.clone()) {
                        parsed.tests.push(value.into_owned());
                    }
                }
                CONSENT_PARAM if parsed.consent.is_none() => {
                    parsed.consent = Some(value.into_owned());
                }
                _ => {}
            }
        }
        parsed
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> AssignerResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(full_body(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response");
            make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty};
    use hyper::header::{COOKIE, USER_AGENT};
    use serde_json::{Value, json};
    use std::net::SocketAddr;

    fn test_service() -> AssignerService {
        let config: Config = serde_yaml::from_str(
            r#"
listener: {host: "127.0.0.1", port: 3000}
admin_listener: {host: "127.0.0.1", port: 3001}
cors_origins: [https://shop.example]
salt: {type: static, value: salt}
experiments:
    checkout-button: {control: 3, treatment: 1}
    hero_banner: {a: 1, b: 1, c: 1}
    pricing: {b: 1, a: 2}
"#,
        )
        .unwrap();
        config.validate().unwrap();
        AssignerService::new(&config)
    }

    fn get(uri: &str) -> http::request::Builder {
        Request::builder().method(Method::GET).uri(uri)
    }

    async fn body_json(response: AssignerResponse) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_assign_with_hash_cookie() {
        let service = test_service();
        let req = get("/assign?test=checkout-button&test=pricing")
            .header(COOKIE, "_ms_h=abc")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = service.handle(&req);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({
                "assignments": {"checkout-button": "treatment", "pricing": "b"},
                "ab": [
                    {"name": "checkout-button", "variant": "treatment", "def": "{\"control\":3,\"treatment\":1}"},
                    {"name": "pricing", "variant": "b", "def": "{\"a\":2,\"b\":1}"},
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_assign_derived_identity() {
        let service = test_service();
        let peer: SocketAddr = "203.0.113.7:52100".parse().unwrap();
        let mut req = get("/assign?test=hero_banner")
            .header(USER_AGENT, "Mozilla/5.0")
            .body(Empty::<Bytes>::new())
            .unwrap();
        req.extensions_mut().insert(PeerAddr(peer));

        let identity = crate::identity::identity_hash("203.0.113.7", Some("Mozilla/5.0"), "salt");
        let expected = crate::bucketing::assign(&identity, "hero_banner", [("a", 1), ("b", 1), ("c", 1)])
            .unwrap();

        let body = body_json(service.handle(&req)).await;
        assert_eq!(body["assignments"]["hero_banner"], expected.variant.as_str());
        assert_eq!(body["ab"][0]["def"], expected.def.as_str());

        // Same visitor, same answer
        let body_again = body_json(service.handle(&req)).await;
        assert_eq!(body, body_again);
    }

    #[tokio::test]
    async fn test_duplicate_tests_assigned_once() {
        let service = test_service();
        let req = get("/assign?test=pricing&test=pricing")
            .header(COOKIE, "_ms_h=deadbeef")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let body = body_json(service.handle(&req)).await;
        assert_eq!(body["ab"].as_array().unwrap().len(), 1);
        assert_eq!(body["assignments"]["pricing"], "a");
    }

    #[tokio::test]
    async fn test_assign_errors() {
        let service = test_service();
        let cases = [
            ("/assign?test=Invalid%20Name!", StatusCode::BAD_REQUEST),
            ("/assign?test=unknown", StatusCode::NOT_FOUND),
            ("/assign?test=pricing&test=unknown", StatusCode::NOT_FOUND),
            ("/assign", StatusCode::BAD_REQUEST),
            ("/assign?other=1", StatusCode::BAD_REQUEST),
        ];

        for (uri, status) in cases {
            let req = get(uri)
                .header(COOKIE, "_ms_h=abc")
                .body(Empty::<Bytes>::new())
                .unwrap();
            let response = service.handle(&req);
            assert_eq!(response.status(), status, "{uri}");
            let body = body_json(response).await;
            assert!(body["error"].is_string(), "{uri}");
        }

        // Neither a hash cookie nor a client address
        let req = get("/assign?test=pricing")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(service.handle(&req).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_routing() {
        let service = test_service();

        let req = get("/other").body(Empty::<Bytes>::new()).unwrap();
        assert_eq!(service.handle(&req).status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/assign?test=pricing")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(
            service.handle(&req).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/assign")
            .header(ORIGIN, "https://shop.example")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = service.handle(&req);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://shop.example"
        );
    }

    #[test]
    fn test_cors_only_for_allowed_origins() {
        let service = test_service();

        let req = get("/assign?test=pricing")
            .header(COOKIE, "_ms_h=abc")
            .header(ORIGIN, "https://shop.example")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = service.handle(&req);
        let headers = response.headers();
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "https://shop.example");
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_METHODS).unwrap(), "GET,OPTIONS");

        let req = get("/assign?test=pricing")
            .header(COOKIE, "_ms_h=abc")
            .header(ORIGIN, "https://evil.example")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = service.handle(&req);
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_parse_query() {
        let query = AssignQuery::parse("test=b&x=1&test=a&test=b&consent=granted&consent=revoked");
        assert_eq!(query.tests, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(query.consent.as_deref(), Some("granted"));

        let query = AssignQuery::parse("test=hero%5Fbanner");
        assert_eq!(query.tests, vec!["hero_banner".to_string()]);
        assert_eq!(query.consent, None);

        assert_eq!(AssignQuery::parse(""), AssignQuery::default());

        let many = (0..10_000)
            .map(|i| format!("test=t{}", i % 3))
            .collect::<Vec<_>>()
            .join("&");
        assert_eq!(AssignQuery::parse(&many).tests.len(), 3);
    }

    fn set_cookies(response: &AssignerResponse) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_consent_granted_sets_identity_cookies() {
        let service = test_service();
        let peer: SocketAddr = "203.0.113.7:52100".parse().unwrap();
        let mut req = get("/assign?test=pricing&consent=granted")
            .header(USER_AGENT, "Mozilla/5.0")
            .body(Empty::<Bytes>::new())
            .unwrap();
        req.extensions_mut().insert(PeerAddr(peer));

        let response = service.handle(&req);
        assert_eq!(response.status(), StatusCode::OK);

        let identity = crate::identity::identity_hash("203.0.113.7", Some("Mozilla/5.0"), "salt");
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("_ms_cid="));
        assert_eq!(
            cookies[1],
            format!("_ms_h={identity}; Max-Age=31536000; Path=/; SameSite=None; Secure")
        );

        // The stored hash keeps the assignment once the derived one changes
        let stored = body_json(response).await;
        let later = get("/assign?test=pricing")
            .header(COOKIE, format!("_ms_h={identity}"))
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(body_json(service.handle(&later)).await, stored);
    }

    #[tokio::test]
    async fn test_consent_revoked_expires_cookies() {
        let service = test_service();
        let peer: SocketAddr = "203.0.113.7:52100".parse().unwrap();
        let mut req = get("/assign?test=pricing&consent=revoked")
            .header(COOKIE, "_ms_h=abc; _ms_cid=known-client")
            .header(USER_AGENT, "Mozilla/5.0")
            .body(Empty::<Bytes>::new())
            .unwrap();
        req.extensions_mut().insert(PeerAddr(peer));

        let response = service.handle(&req);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            set_cookies(&response),
            vec![
                "_ms_cid=; Max-Age=0; Path=/; SameSite=None; Secure".to_string(),
                "_ms_h=; Max-Age=0; Path=/; SameSite=None; Secure".to_string(),
            ]
        );

        // Assigned from the derived hash, not the revoked cookie
        let identity = crate::identity::identity_hash("203.0.113.7", Some("Mozilla/5.0"), "salt");
        let expected = crate::bucketing::assign(&identity, "pricing", [("a", 2), ("b", 1)]).unwrap();
        let body = body_json(response).await;
        assert_eq!(body["assignments"]["pricing"], expected.variant.as_str());
    }

    #[tokio::test]
    async fn test_consent_without_tests() {
        let service = test_service();
        let req = get("/assign?consent=granted")
            .header(COOKIE, "_ms_h=abc")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = service.handle(&req);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(set_cookies(&response).len(), 2);
        assert_eq!(
            body_json(response).await,
            json!({"assignments": {}, "ab": []})
        );

        let req = get("/assign?test=pricing&consent=maybe")
            .header(COOKIE, "_ms_h=abc")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = service.handle(&req);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(set_cookies(&response).is_empty());
    }

    #[test]
    fn test_plain_assignment_sets_no_cookies() {
        let service = test_service();
        let req = get("/assign?test=pricing")
            .header(COOKIE, "_ms_h=abc")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(set_cookies(&service.handle(&req)).is_empty());
    }
}
