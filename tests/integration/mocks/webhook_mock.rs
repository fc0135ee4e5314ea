use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Webhook endpoint answering every alert batch with `status`
pub async fn setup_webhook_mock(status: u16) -> MockServer {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&mock_server)
        .await;

    mock_server
}
