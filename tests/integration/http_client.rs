use base64::{engine::general_purpose, Engine};
use komagen::config::ServiceConfig;
use komagen::error::ServiceError;
use komagen::service::{AdapterAttachment, ForgeClient, GenerationService, ServicePayload};
use komagen::types::SamplingParams;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(base_url: &str) -> ForgeClient {
    let config = ServiceConfig {
        base_url: base_url.to_string(),
        connect_timeout_secs: 1,
        request_timeout_secs: 1,
        probe_timeout_secs: 1,
    };
    ForgeClient::new(&config).unwrap()
}

fn payload(prompt: &str) -> ServicePayload {
    ServicePayload::text_only(prompt, SamplingParams::default())
}

fn encoded(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

async fn mount_json(server: &MockServer, verb: &str, route: &str, body: Value) {
    Mock::given(method(verb))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn txt2img_decodes_images_and_seeds() {
    let server = MockServer::start().await;
    mount_json(
        &server,
        "POST",
        "/sdapi/v1/txt2img",
        json!({
            "images": [encoded(b"first"), encoded(b"second")],
            "info": "{\"seed\": 41, \"all_seeds\": [41, 42]}"
        }),
    )
    .await;

    let mut request = payload("rooftop at dusk");
    request.feature_adapter = Some(AdapterAttachment {
        image: Arc::new(b"reference".to_vec()),
        strength: 0.7,
        model: "ip-adapter-plus_sdxl_vit-h".to_string(),
    });
    let images = client(&server.uri()).generate(&request).await.unwrap();
    assert_eq!(images.images, vec![b"first".to_vec(), b"second".to_vec()]);
    assert_eq!(images.seed_for(1), Some(42));

    let received = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["prompt"], "rooftop at dusk");
    assert_eq!(body["seed"], -1);
    let unit = &body["alwayson_scripts"]["ControlNet"]["args"][0];
    assert_eq!(unit["image"], encoded(b"reference"));
    assert_eq!(unit["model"], "ip-adapter-plus_sdxl_vit-h");
}

#[tokio::test]
async fn validation_errors_become_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "detail": [{"loc": ["body", "width"], "msg": "must be a multiple of 8"}]
        })))
        .mount(&server)
        .await;

    let err = client(&server.uri())
        .generate(&payload("bad size"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Rejected("HTTP 422: body.width: must be a multiple of 8".to_string())
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn empty_image_list_is_malformed() {
    let server = MockServer::start().await;
    mount_json(&server, "POST", "/sdapi/v1/txt2img", json!({"images": []})).await;

    let err = client(&server.uri())
        .generate(&payload("nothing"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::MalformedResponse(_)));
}

#[tokio::test]
async fn slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sdapi/v1/txt2img"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"images": [encoded(b"late")]}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = client(&server.uri())
        .generate(&payload("slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Timeout(_)), "got {:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let err = client("http://127.0.0.1:9")
        .check_availability()
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unreachable(_)), "got {:?}", err);
}

#[tokio::test]
async fn probe_discovers_installed_extensions() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/sdapi/v1/progress", json!({"progress": 0.0})).await;
    mount_json(
        &server,
        "GET",
        "/sdapi/v1/scripts",
        json!({"txt2img": ["controlnet", "regional prompter", "adetailer"], "img2img": []}),
    )
    .await;
    mount_json(
        &server,
        "GET",
        "/controlnet/model_list",
        json!({"model_list": [
            "ip-adapter_sd15 [6a3f]",
            "ip-adapter-plus_sdxl_vit-h [f1e2]",
            "control_v11p_sd15_openpose [cab7]"
        ]}),
    )
    .await;
    mount_json(
        &server,
        "GET",
        "/sdapi/v1/options",
        json!({"sd_model_checkpoint": "animagine-xl-3.1"}),
    )
    .await;

    let endpoint = client(&server.uri()).check_availability().await.unwrap();
    assert!(endpoint.available);
    assert_eq!(endpoint.model.as_deref(), Some("animagine-xl-3.1"));
    let caps = endpoint.capabilities;
    assert_eq!(
        caps.feature_adapter.as_deref(),
        Some("ip-adapter-plus_sdxl_vit-h [f1e2]")
    );
    assert_eq!(
        caps.pose_conditioning.as_deref(),
        Some("control_v11p_sd15_openpose [cab7]")
    );
    assert!(caps.multi_region);
    assert!(caps.face_correction);
}

#[tokio::test]
async fn bare_service_is_available_without_capabilities() {
    let server = MockServer::start().await;
    mount_json(&server, "GET", "/sdapi/v1/progress", json!({"progress": 0.0})).await;

    let endpoint = client(&server.uri()).check_availability().await.unwrap();
    assert!(endpoint.available);
    assert!(endpoint.model.is_none());
    assert!(endpoint.capabilities.feature_adapter.is_none());
    assert!(!endpoint.capabilities.multi_region);
}
