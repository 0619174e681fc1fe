//! SMS and push drivers against a local HTTP gateway.

use std::time::Duration;

use courier_channels::{PushConfig, PushDriver, SmsConfig, SmsDriver, SIGNATURE_HEADER};
use courier_core::{CallContext, ChannelDriver, JsonMap, RenderedContent};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sms_content() -> RenderedContent {
    RenderedContent::new("", "Order A-100 shipped")
}

#[tokio::test]
async fn test_sms_sends_bearer_and_returns_message_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sms"))
        .and(header("authorization", "Bearer sekrit"))
        .and(body_json(json!({
            "to": "+15551234567",
            "body": "Order A-100 shipped",
            "from": "SHOP"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "sms-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let driver = SmsDriver::new(
        SmsConfig::new(format!("{}/sms", server.uri()))
            .with_token("sekrit")
            .with_sender_id("SHOP"),
    );
    let receipt = driver
        .send(
            &CallContext::background(),
            "+15551234567",
            &sms_content(),
            &JsonMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.provider_message_id, "sms-42");
    assert_eq!(receipt.response.unwrap()["message_id"], "sms-42");
}

#[tokio::test]
async fn test_sms_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let driver = SmsDriver::new(SmsConfig::new(server.uri()));
    let err = driver
        .send(
            &CallContext::background(),
            "+15551234567",
            &sms_content(),
            &JsonMap::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.code(), "http_503");
}

#[tokio::test]
async fn test_sms_throttled_is_transient_and_bad_number_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown subscriber"))
        .mount(&server)
        .await;

    let driver = SmsDriver::new(SmsConfig::new(server.uri()));
    let ctx = CallContext::background();

    let throttled = driver
        .send(&ctx, "+15551234567", &sms_content(), &JsonMap::new())
        .await
        .unwrap_err();
    assert!(throttled.is_transient());

    let rejected = driver
        .send(&ctx, "+15551234567", &sms_content(), &JsonMap::new())
        .await
        .unwrap_err();
    assert!(!rejected.is_transient());
    assert_eq!(rejected.code(), "http_400");
    assert_eq!(rejected.message(), "unknown subscriber");
}

#[tokio::test]
async fn test_sms_slow_gateway_hits_caller_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "late"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let driver = SmsDriver::new(SmsConfig::new(server.uri()));
    let ctx = CallContext::with_timeout(Duration::from_millis(200));
    let err = driver
        .send(&ctx, "+15551234567", &sms_content(), &JsonMap::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_success_without_message_id_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
        .mount(&server)
        .await;

    let driver = SmsDriver::new(SmsConfig::new(server.uri()));
    let err = driver
        .send(
            &CallContext::background(),
            "+15551234567",
            &sms_content(),
            &JsonMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "missing_message_id");
}

#[tokio::test]
async fn test_push_signs_body_with_gateway_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push"))
        .and(header_exists(SIGNATURE_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "push-7"})))
        .expect(1)
        .mount(&server)
        .await;

    let driver = PushDriver::new(
        PushConfig::new(format!("{}/push", server.uri())).with_signing_key("push-key"),
    );
    let mut data = JsonMap::new();
    data.insert("order_no".into(), json!("A-100"));
    let receipt = driver
        .send(
            &CallContext::background(),
            "device-token-1",
            &RenderedContent::new("Shipped", "Order A-100 is on its way"),
            &data,
        )
        .await
        .unwrap();
    assert_eq!(receipt.provider_message_id, "push-7");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    let sent: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(sent["token"], "device-token-1");
    assert_eq!(sent["title"], "Shipped");
    assert_eq!(sent["data"]["order_no"], "A-100");

    let mut mac = Hmac::<Sha256>::new_from_slice(b"push-key").unwrap();
    mac.update(&req.body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    let got = req
        .headers
        .get(SIGNATURE_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_push_unregistered_token_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410).set_body_string("token unregistered"))
        .mount(&server)
        .await;

    let driver = PushDriver::new(PushConfig::new(server.uri()));
    let err = driver
        .send(
            &CallContext::background(),
            "stale-token",
            &RenderedContent::new("t", "b"),
            &JsonMap::new(),
        )
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(err.code(), "http_410");
}

#[tokio::test]
async fn test_unreachable_gateway_is_transient() {
    // Nothing listens on the discard port.
    let driver = PushDriver::new(
        PushConfig::new("http://127.0.0.1:9/push").with_timeout(Duration::from_secs(2)),
    );
    let err = driver
        .send(
            &CallContext::background(),
            "tok",
            &RenderedContent::new("t", "b"),
            &JsonMap::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_transient());
}
