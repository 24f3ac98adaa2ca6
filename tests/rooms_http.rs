mod support;

use serde_json::Value;

#[tokio::test]
async fn room_listing_starts_empty() {
    let base_url = support::ensure_server();

    let res = reqwest::get(format!("{base_url}/rooms"))
        .await
        .expect("request should succeed");
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    let body: Value = res.json().await.expect("json body");
    assert!(body["rooms"].is_array());
    assert!(body["playersOnline"].is_u64());
    assert!(body["playersSeen"].is_u64());
}

#[tokio::test]
async fn unknown_room_routes_to_not_found() {
    let base_url = support::ensure_server();
    let room_code = format!("room-{}", uuid::Uuid::new_v4().simple());

    let res = reqwest::get(format!("{base_url}/rooms/{room_code}"))
        .await
        .expect("request should succeed");
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);

    let body: Value = res.json().await.expect("json body");
    assert_eq!(body["view"], "not-found");
    assert_eq!(body["roomCode"], room_code.as_str());
}

#[tokio::test]
async fn hosts_always_get_the_host_view() {
    let base_url = support::ensure_server();

    let res = reqwest::get(format!("{base_url}/rooms/room-new?is_host=true"))
        .await
        .expect("request should succeed");
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    let body: Value = res.json().await.expect("json body");
    assert_eq!(body["view"], "host");
}
