mod common;
use common::*;

use rustmidea::MideaError;
use serde_json::json;

#[tokio::test]
async fn request_returns_result_member() {
    let mock = MockTransport::new();
    mock.on("dummy", json!({"result": "response text"}));
    let cloud = cloud(&mock);

    let result = cloud.api_request("dummy", &[("key", "value")], false).await.unwrap();
    assert_eq!(result, Some(json!("response text")));

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    let form = &requests[0].form;
    assert_eq!(form["appId"], "1017");
    assert_eq!(form["format"], "2");
    assert_eq!(form["key"], "value");
    assert_eq!(form["sign"].len(), 64);
    assert!(!form.contains_key("sessionId"));
}

#[tokio::test]
async fn request_without_result_is_none() {
    let mock = MockTransport::new();
    mock.on("dummy", json!({"errorCode": "0"}));
    let cloud = cloud(&mock);

    assert_eq!(cloud.api_request("dummy", &[], false).await.unwrap(), None);
}

#[tokio::test]
async fn error_codes_map_to_error_kinds() {
    let mock = MockTransport::new();
    mock.on("generic", json!({"errorCode": "2", "msg": "error message"}));
    mock.on("retry", json!({"errorCode": "7610", "msg": "retry error message"}));
    mock.on("auth", json!({"errorCode": "3102", "msg": "authentication error"}));
    mock.on("unknown", json!({"errorCode": "9999", "msg": "unknown"}));
    let cloud = cloud(&mock);

    let err = cloud.api_request("generic", &[], false).await.unwrap_err();
    assert_eq!(err.to_string(), "Midea cloud API error 2 error message");

    let err = cloud.api_request("retry", &[], false).await.unwrap_err();
    assert!(matches!(err, MideaError::RetryLater { code: 7610, .. }));
    assert_eq!(err.to_string(), "Retry later 7610 retry error message");

    let err = cloud.api_request("auth", &[], false).await.unwrap_err();
    assert!(matches!(err, MideaError::CloudAuthentication { code: 3102, .. }));

    let err = cloud.api_request("unknown", &[], false).await.unwrap_err();
    assert_eq!(err.code(), Some(9999));

    // None of them triggers a retry.
    assert_eq!(mock.endpoints(), ["generic", "retry", "auth", "unknown"]);
}

#[tokio::test]
async fn transport_failure_names_the_endpoint() {
    let mock = MockTransport::new();
    mock.fail("exception", "simulated");
    let cloud = cloud(&mock);

    let err = cloud.api_request("exception", &[], false).await.unwrap_err();
    assert_eq!(err.to_string(), "Request error simulated while calling exception");
}

#[tokio::test]
async fn malformed_body_names_the_endpoint() {
    let mock = MockTransport::new();
    mock.on_text("garbled", "<html>gateway error</html>");
    let cloud = cloud(&mock);

    let err = cloud.api_request("garbled", &[], false).await.unwrap_err();
    let MideaError::CloudRequest { endpoint, message } = &err else {
        panic!("expected a request error, got {:?}", err);
    };
    assert_eq!(endpoint, "garbled");
    assert!(message.starts_with("Invalid response "), "{}", message);
    assert!(message.ends_with(" while calling garbled"), "{}", message);
}

#[tokio::test]
async fn invalid_session_logs_in_again() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    mock.on("dummy", json!({"errorCode": "3106", "msg": "session invalid"}));
    mock.on("dummy", json!({"result": "successful"}));
    let cloud = cloud(&mock);

    let result = cloud.api_request("dummy", &[], false).await.unwrap();
    assert_eq!(result, Some(json!("successful")));
    assert_eq!(
        mock.endpoints(),
        ["dummy", "user/login/id/get", "user/login", "dummy"]
    );
    let retried = &mock.requests()[3].form;
    assert_eq!(retried["sessionId"], "session-1");
}

#[tokio::test]
async fn full_restart_refreshes_appliances() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    with_appliance_list(&mock);
    mock.on("dummy", json!({"errorCode": "3144"}));
    mock.on("dummy", json!({"result": "successful"}));
    let cloud = cloud(&mock);

    let result = cloud.api_request("dummy", &[], false).await.unwrap();
    assert_eq!(result, Some(json!("successful")));
    assert_eq!(
        mock.endpoints(),
        [
            "dummy",
            "user/login/id/get",
            "user/login",
            "homegroup/list/get",
            "appliance/list/get",
            "dummy"
        ]
    );
    let session = cloud.session().unwrap();
    assert_eq!(session.login_id, "test-login");
    assert_eq!(session.session_id, "session-1");
}

#[tokio::test]
async fn repeated_restart_requests_give_up() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    with_appliance_list(&mock);
    mock.on("full-restart", json!({"errorCode": "3144"}));
    mock.on("too-many-retries", json!({"errorCode": "3106"}));
    let cloud = cloud(&mock);

    let err = cloud.api_request("full-restart", &[], false).await.unwrap_err();
    assert_eq!(err.to_string(), "Too many retries while calling full-restart");

    let err = cloud
        .api_request("too-many-retries", &[], false)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Too many retries while calling too-many-retries");
    assert_eq!(mock.count("too-many-retries"), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_login() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    for endpoint in ["first", "second"] {
        mock.on(endpoint, json!({"errorCode": "3106"}));
        mock.on(endpoint, json!({"result": endpoint}));
    }
    let cloud = cloud(&mock);
    cloud.authenticate().await.unwrap();
    assert_eq!(mock.count("user/login"), 1);

    let (first, second) = tokio::join!(
        cloud.api_request("first", &[], true),
        cloud.api_request("second", &[], true)
    );
    assert_eq!(first.unwrap(), Some(json!("first")));
    assert_eq!(second.unwrap(), Some(json!("second")));
    assert_eq!(mock.count("user/login"), 2);
}

#[tokio::test]
async fn appliance_list_is_cached() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    with_appliance_list(&mock);
    let cloud = cloud(&mock);

    let appliances = cloud.list_appliances(false).await.unwrap();
    assert_eq!(appliances.len(), 2);
    assert_eq!(appliances[0].appliance_id(), Some(1));
    assert_eq!(appliances[1].type_byte(), Some(0xA1));
    let calls = mock.count("appliance/list/get");

    cloud.list_appliances(false).await.unwrap();
    assert_eq!(mock.count("appliance/list/get"), calls);

    cloud.list_appliances(true).await.unwrap();
    assert_eq!(mock.count("appliance/list/get"), calls + 1);
}

#[tokio::test]
async fn home_group_errors() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    mock.on(
        "homegroup/list/get",
        json!({"result": {"list": [{"isDefault": "0", "id": "group-id-1"}]}}),
    );
    let cloud = cloud(&mock);

    let err = cloud.list_appliances(false).await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to get default home group from Midea API");

    mock.replace("homegroup/list/get", json!({"result": {}}));
    let err = cloud.list_appliances(true).await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to get home groups from Midea API");
}

#[tokio::test]
async fn tokens_are_looked_up_once() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    mock.on(
        "iot/secure/getToken",
        json!({"result": {"tokenlist": [
            {"udpId": "2", "token": "token-2", "key": "key-2"},
            {"udpId": "1", "token": "token-1", "key": "key-1"}
        ]}}),
    );
    let cloud = cloud(&mock);

    let found = cloud.get_token("1").await.unwrap();
    assert_eq!(found, ("token-1".to_string(), "key-1".to_string()));
    let found = cloud.get_token("2").await.unwrap();
    assert_eq!(found, ("token-2".to_string(), "key-2".to_string()));
    assert_eq!(mock.count("iot/secure/getToken"), 1);

    let missing = cloud.get_token("absent").await.unwrap();
    assert_eq!(missing, (String::new(), String::new()));
    assert_eq!(mock.count("iot/secure/getToken"), 2);
}

#[tokio::test]
async fn transparent_send_decodes_reply() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    mock.on(
        "appliance/transparent/send",
        json!({"result": {"reply": TRANSPARENT_REPLY}}),
    );
    let cloud = cloud(&mock);

    let command = hex::decode("aa20a100000000000303").unwrap();
    let frames = cloud
        .appliance_transparent_send(12345, &command)
        .await
        .unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(hex::encode(&frames[0]), TRANSPARENT_FRAME);

    let request = mock
        .requests()
        .into_iter()
        .find(|r| r.endpoint == "appliance/transparent/send")
        .unwrap();
    assert_eq!(request.form["applianceId"], "12345");
    assert_eq!(request.form["funId"], "0000");
    let order = cloud
        .security()
        .aes_decrypt_string(&request.form["order"])
        .unwrap();
    assert!(order.starts_with("90,90,1,0,89,0,32,0,1,0,0,0"), "{}", order);
}

#[tokio::test]
async fn encrypted_request_sends_data_field() {
    let mock = MockTransport::new();
    with_login(&mock, ACCESS_TOKEN);
    mock.on("secure/endpoint", json!({"result": {"value": 1}}));
    let cloud = cloud(&mock);

    let result = cloud
        .api_request_encrypted("secure/endpoint", &json!({"key": "value"}), true)
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"value": 1})));

    let request = mock.requests().pop().unwrap();
    assert_eq!(request.endpoint, "secure/endpoint");
    assert!(!request.form["data"].is_empty());
    assert_eq!(request.form["sessionId"], "session-1");
}
