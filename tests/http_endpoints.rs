use chrono::{Duration, Utc};
use m3u_matrix_lib::epg::parse_xmltv;
use m3u_matrix_lib::schedule::{NewShow, ScheduleStore};
use m3u_matrix_lib::server::{serve_listener, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;

async fn start_server() -> String {
    let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
    let ch = store.add_channel("Retro", None).unwrap();
    let now = Utc::now().naive_utc();
    let start = now - Duration::minutes(15);
    let sched = store
        .create_schedule("Live", ch, start, start + Duration::hours(3))
        .unwrap();
    let show = store.add_show(&NewShow::new("Cartoons", 30)).unwrap();
    store
        .add_time_slot(sched, show, start, start + Duration::minutes(30))
        .unwrap();

    let guide_start = Utc::now() - Duration::minutes(5);
    let xml = format!(
        r#"<tv><channel id="alpha"><display-name>Alpha TV</display-name></channel>
        <programme channel="alpha" start="{}" stop="{}"><title>Morning Show</title></programme></tv>"#,
        guide_start.format("%Y%m%d%H%M%S +0000"),
        (guide_start + Duration::hours(1)).format("%Y%m%d%H%M%S +0000")
    );
    let state = ServerState::new(store, parse_xmltv(&xml));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_listener(listener, state));
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_now_json() {
    let base = start_server().await;
    let body: serde_json::Value = reqwest::get(format!("{}/now.json", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(body["generated_at"].is_string());
    let channels = body["channels"].as_array().unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0]["name"], "Retro");
    assert_eq!(channels[0]["now"]["show_title"], "Cartoons");
    assert!(channels[0]["next"].is_null());

    let resp = reqwest::get(format!("{}/now.json?channel=nobody", base)).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_schedules_and_epg_json() {
    let base = start_server().await;
    let schedules: serde_json::Value = reqwest::get(format!("{}/schedules.json", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(schedules[0]["name"], "Live");
    assert_eq!(schedules[0]["slot_count"], 1);

    let epg: serde_json::Value = reqwest::get(format!("{}/epg.json?channel=alpha", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(epg[0]["name"], "Alpha TV");
    assert_eq!(epg[0]["now"]["title"], "Morning Show");
}

#[tokio::test]
async fn test_unknown_path_is_json_404() {
    let base = start_server().await;
    let resp = reqwest::get(format!("{}/player.html", base)).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("/player.html"));
}
