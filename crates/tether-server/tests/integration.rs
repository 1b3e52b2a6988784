//! End-to-end tests against a real server bound to an ephemeral port.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tether_core::protocol::{AuthResponse, HubMessage, PublishAck};
use tether_core::{RichValue, RpcError};
use tether_server::rpc::{Args, Dispatcher, Module, Reply, context};
use tether_server::{HubClient, ServerConfig, ServerHandle, TetherServer};

/// Sets a flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Uppercase;

#[async_trait]
impl HubClient for Uppercase {
    async fn on_message(&self, message: HubMessage) -> Option<RichValue> {
        message
            .payload
            .as_str()
            .map(|s| RichValue::from(s.to_uppercase()))
    }
}

fn users_module() -> Module {
    Module::builder("users")
        .operation("getUser", |args: Args| async move {
            let id: i64 = args.get(0)?;
            let is_active: bool = args.get(1)?;
            Reply::json(&json!({ "id": id, "isActive": is_active }))
        })
        .operation("postUser", |args: Args| async move {
            let user: Value = args.get(0)?;
            let name = user["name"].as_str().unwrap_or_default().to_owned();
            Reply::json(&json!({ "status": "User created", "name": name }))
        })
        .operation("getWhoami", |_args: Args| async {
            let id = context::current_principal().map(|p| p.id);
            Reply::json(&json!({ "principal": id }))
        })
        .operation("deleteUser", |_args: Args| async { Ok::<_, RpcError>(Reply::Empty) })
        .roles("deleteUser", ["admin"])
        .build()
        .unwrap()
}

fn streams_module(dropped: Arc<AtomicBool>) -> Module {
    Module::builder("streams")
        .operation("getCount", |_args: Args| async {
            let values = async_stream::stream! {
                for n in 1..=3_i64 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    yield Ok::<_, RpcError>(RichValue::from(n));
                }
            };
            Ok::<_, RpcError>(Reply::generator(values))
        })
        .operation("getEndless", move |_args: Args| {
            let flag = DropFlag(Arc::clone(&dropped));
            async move {
                let values = async_stream::stream! {
                    let _flag = flag;
                    let mut n = 0_i64;
                    loop {
                        yield Ok::<_, RpcError>(RichValue::from(n));
                        n += 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                };
                Ok::<_, RpcError>(Reply::generator(values))
            }
        })
        .build()
        .unwrap()
}

struct TestServer {
    handle: ServerHandle,
    server_hub: Arc<tether_server::Hub>,
    admin_token: String,
    http: reqwest::Client,
    endless_dropped: Arc<AtomicBool>,
}

impl TestServer {
    async fn start() -> Self {
        let endless_dropped = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new()
            .with_module(users_module())
            .unwrap()
            .with_module(streams_module(Arc::clone(&endless_dropped)))
            .unwrap();
        let config = ServerConfig {
            port: 0,
            jwt_secret: Some("integration".into()),
            keep_alive_interval_ms: 60_000,
            ..ServerConfig::default()
        };
        let users = tether_server::users::InMemoryUserProvider::new().with_user(
            tether_core::Principal::new("admin")
                .with_roles(["admin"])
                .with_credential_hash(tether_server::auth::hash_credential("admin", "secret")),
        );
        let server = TetherServer::with_users(config, dispatcher, Arc::new(users));
        server.hub().register_client("upper", Arc::new(Uppercase));
        let server_hub = Arc::clone(server.hub());
        let admin_token = server.auth().tokens().issue("admin").unwrap();
        let handle = server.start().await.unwrap();
        Self {
            handle,
            server_hub,
            admin_token,
            http: reqwest::Client::new(),
            endless_dropped,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.handle.base_url())
    }

    async fn guest(&self) -> AuthResponse {
        self.http
            .post(self.url("/guest"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn subscribe(&self, token: &str) -> BoxStream<'static, Event> {
        let resp = self
            .http
            .get(self.url("/subscribe"))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        resp.bytes_stream().eventsource().map(Result::unwrap).boxed()
    }
}

async fn next_named(events: &mut (impl Stream<Item = Event> + Unpin), name: &str) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.next().await.expect("stream ended");
            if event.event == name {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn scenario_get_with_path_arguments() {
    let ts = TestServer::start().await;
    let resp = ts.http.get(ts.url("/api/users/user/123/true")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "id": 123, "isActive": true }));
}

#[tokio::test]
async fn scenario_post_with_object_body() {
    let ts = TestServer::start().await;
    let resp = ts
        .http
        .post(ts.url("/api/users/user"))
        .header("content-type", "application/json")
        .body(r#"{"name":"Alice","age":30}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "status": "User created", "name": "Alice" }));
}

#[tokio::test]
async fn scenario_publish_to_unknown_recipient() {
    let ts = TestServer::start().await;
    let u1 = ts.guest().await;
    let mut events = ts.subscribe(&u1.token).await;
    let _ = next_named(&mut events, "connected").await;

    let resp = ts
        .http
        .post(ts.url("/publish"))
        .bearer_auth(&u1.token)
        .json(&json!({ "to": "ghost", "payload": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn scenario_generator_yields_in_order_then_ends() {
    let ts = TestServer::start().await;
    let resp = ts.http.get(ts.url("/api/streams/count")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-tether-stream"], "generator");
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let events: Vec<Event> = resp
        .bytes_stream()
        .eventsource()
        .map(Result::unwrap)
        .collect()
        .await;
    let values: Vec<&str> = events
        .iter()
        .filter(|e| e.event == "message")
        .map(|e| e.data.as_str())
        .collect();
    assert_eq!(values, ["1", "2", "3"]);
    assert_eq!(events.last().map(|e| e.event.as_str()), Some("end"));
}

#[tokio::test]
async fn scenario_anonymous_call_has_no_principal() {
    let ts = TestServer::start().await;
    let resp = ts.http.get(ts.url("/api/users/whoami")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "principal": null }));
}

#[tokio::test]
async fn principal_is_visible_to_authenticated_calls() {
    let ts = TestServer::start().await;
    let resp = ts
        .http
        .get(ts.url("/api/users/whoami"))
        .bearer_auth(&ts.admin_token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "principal": "admin" }));
}

#[tokio::test]
async fn role_table() {
    let ts = TestServer::start().await;
    let url = ts.url("/api/users/user/1");

    let resp = ts.http.delete(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = ts.http.delete(&url).bearer_auth("not-a-jwt").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let guest = ts.guest().await;
    let resp = ts.http.delete(&url).bearer_auth(&guest.token).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.text().await.unwrap(), "Forbidden");

    let login: AuthResponse = ts
        .http
        .post(ts.url("/login"))
        .json(&json!({ "username": "admin", "password": "secret" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let resp = ts.http.delete(&url).bearer_auth(&login.token).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn aborting_generator_drops_it() {
    let ts = TestServer::start().await;
    let resp = ts.http.get(ts.url("/api/streams/endless")).send().await.unwrap();
    let mut events = Box::pin(resp.bytes_stream().eventsource());
    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first.data, "0");
    assert!(!ts.endless_dropped.load(Ordering::SeqCst));
    drop(events);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !ts.endless_dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("generator was not dropped after client disconnect");
}

#[tokio::test]
async fn publish_between_users() {
    let ts = TestServer::start().await;
    let alice = ts.guest().await;
    let bob = ts.guest().await;
    let mut bob_events = ts.subscribe(&bob.token).await;
    let connected = next_named(&mut bob_events, "connected").await;
    let connected: Value = serde_json::from_str(&connected.data).unwrap();
    assert_eq!(connected["userId"], bob.user.id.as_str());

    let ack: PublishAck = ts
        .http
        .post(ts.url("/publish"))
        .bearer_auth(&alice.token)
        .json(&json!({ "to": bob.user.id, "payload": { "text": "hello" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ack.delivered);

    let event = next_named(&mut bob_events, "message").await;
    let message: HubMessage = serde_json::from_str(&event.data).unwrap();
    assert_eq!(message.id, ack.id);
    assert_eq!(message.from, alice.user.id);
    assert_eq!(message.payload.get("text").and_then(RichValue::as_str), Some("hello"));
}

#[tokio::test]
async fn in_process_client_replies_to_subscribed_sender() {
    let ts = TestServer::start().await;
    let alice = ts.guest().await;
    let mut events = ts.subscribe(&alice.token).await;
    let _ = next_named(&mut events, "connected").await;

    let resp = ts
        .http
        .post(ts.url("/publish"))
        .bearer_auth(&alice.token)
        .json(&json!({ "to": "upper", "payload": "shout" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let event = next_named(&mut events, "message").await;
    let reply: HubMessage = serde_json::from_str(&event.data).unwrap();
    assert_eq!(reply.from, "upper");
    assert_eq!(reply.to, alice.user.id);
    assert_eq!(reply.payload.as_str(), Some("SHOUT"));
}

#[tokio::test]
async fn reply_to_unsubscribed_sender_is_dropped() {
    let ts = TestServer::start().await;
    let alice = ts.guest().await;

    let ack: PublishAck = ts
        .http
        .post(ts.url("/publish"))
        .bearer_auth(&alice.token)
        .json(&json!({ "to": "upper", "payload": "quiet" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ack.delivered);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!ts.server_hub.is_subscribed(&alice.user.id));

    // A later subscription does not receive the stale reply.
    let mut events = ts.subscribe(&alice.token).await;
    let _ = next_named(&mut events, "connected").await;
    let next = tokio::time::timeout(Duration::from_millis(300), events.next()).await;
    assert!(next.is_err(), "unexpected event after reconnect");
}

#[tokio::test]
async fn second_subscription_replaces_first() {
    let ts = TestServer::start().await;
    let alice = ts.guest().await;
    let mut first = ts.subscribe(&alice.token).await;
    let _ = next_named(&mut first, "connected").await;
    let mut second = ts.subscribe(&alice.token).await;
    let _ = next_named(&mut second, "connected").await;

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while first.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "replaced subscription stayed open");
    assert_eq!(ts.server_hub.subscription_count(), 1);
}

#[tokio::test]
async fn subscribe_with_query_token() {
    let ts = TestServer::start().await;
    let alice = ts.guest().await;
    let resp = ts
        .http
        .get(ts.url(&format!("/subscribe?token={}", alice.token)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut events = Box::pin(resp.bytes_stream().eventsource().map(Result::unwrap));
    let _ = next_named(&mut events, "connected").await;
}

#[tokio::test]
async fn health_and_shutdown() {
    let ts = TestServer::start().await;
    let alice = ts.guest().await;
    let mut events = ts.subscribe(&alice.token).await;
    let _ = next_named(&mut events, "connected").await;

    let health: Value = ts
        .http
        .get(ts.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["subscriptions"], 1);

    let stopped = tokio::time::timeout(Duration::from_secs(10), ts.handle.stop()).await;
    assert!(stopped.is_ok(), "graceful shutdown hung on open subscription");
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while events.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());
}
