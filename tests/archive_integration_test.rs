use chrono::NaiveDate;
use sensolog_archive::archive::ArchiveClient;
use sensolog_archive::config::ArchiveConfig;
use sensolog_archive::sensor_type::ArchiveType;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DAY_PATH: &str = "/2024-01-02/2024-01-02_sds011_sensor_95522.csv";

fn archive_config(server: &MockServer) -> ArchiveConfig {
    ArchiveConfig {
        base_url: server.uri(),
        api_url: format!("{}/airrohr/v1/sensor", server.uri()),
        head_timeout_seconds: 5,
        get_timeout_seconds: 5,
        metadata_timeout_seconds: 5,
        max_retries: 2,
        retry_backoff_ms: 10,
    }
}

fn jan(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

/// Test that the archive URL layout is `<base>/<date>/<date>_<type>_sensor_<id>.csv`
#[tokio::test]
async fn test_file_url_layout() {
    let server = MockServer::start().await;
    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");

    let url = client.file_url(jan(2), 95522, ArchiveType::Sds011);
    assert_eq!(url, format!("{}{}", server.uri(), DAY_PATH));
}

/// Test that only a 200 HEAD response counts as present
#[tokio::test]
async fn test_file_exists_on_200_only() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .and(path("/2024-01-03/2024-01-03_sds011_sensor_95522.csv"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1) // 404 is final, never retried
        .mount(&server)
        .await;

    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");

    assert!(client.file_exists(&client.file_url(jan(2), 95522, ArchiveType::Sds011)).await);
    assert!(!client.file_exists(&client.file_url(jan(3), 95522, ArchiveType::Sds011)).await);
}

/// Test that a transient 503 is retried and the later 200 wins
#[tokio::test]
async fn test_retry_on_service_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");
    assert!(client.file_exists(&format!("{}{}", server.uri(), DAY_PATH)).await);
}

/// Test that retries stop after max_retries and the file is reported absent
#[tokio::test]
async fn test_retry_exhaustion_reports_absent() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(429))
        .expect(3) // first attempt + 2 retries
        .mount(&server)
        .await;

    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");
    assert!(!client.file_exists(&format!("{}{}", server.uri(), DAY_PATH)).await);
}

/// Test that probing without a type tries each common type and keeps every hit
#[tokio::test]
async fn test_files_for_date_probes_common_types() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/2024-01-02/2024-01-02_dht22_sensor_95522.csv"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(10)
        .mount(&server)
        .await;

    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");
    let found = client.files_for_date(95522, jan(2), None).await;

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, ArchiveType::Dht22);
    assert!(found[0].1.ends_with("2024-01-02_dht22_sensor_95522.csv"));
}

/// Test that a download lands under the remote name with no partial file left behind
#[tokio::test]
async fn test_download_to_writes_remote_file() {
    let server = MockServer::start().await;
    let body = "sensor_id;sensor_type;location;lat;lon;timestamp;P1;durP1;ratioP1;P2;durP2;ratioP2\n\
                95522;SDS011;812;23.81;90.41;2024-01-02T00:01:12;12.5;;;7.3;;\n";

    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");
    let url = format!("{}{}", server.uri(), DAY_PATH);

    let file = client
        .download_to(&url, dir.path())
        .await
        .expect("Download should succeed");

    assert_eq!(file, dir.path().join("2024-01-02_sds011_sensor_95522.csv"));
    assert_eq!(std::fs::read_to_string(&file).unwrap(), body);
    assert!(!dir
        .path()
        .join("2024-01-02_sds011_sensor_95522.csv.part")
        .exists());

    // Second call must not hit the server again (expect(1) above)
    let again = client.download_to(&url, dir.path()).await;
    assert_eq!(again, Some(file));
}

/// Test that a failed download leaves nothing on disk
#[tokio::test]
async fn test_download_to_failure_leaves_no_file() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAY_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");

    let result = client
        .download_to(&format!("{}{}", server.uri(), DAY_PATH), dir.path())
        .await;

    assert!(result.is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// Test metadata parsing from the live API shape
#[tokio::test]
async fn test_fetch_metadata_from_api() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/airrohr/v1/sensor/95522/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{"id": 1, "location": {"id": 812, "latitude": "23.81", "longitude": "90.41",
                 "country": "BD", "city": "Dhaka"}}]"#,
        ))
        .mount(&server)
        .await;

    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");
    let metadata = client.fetch_metadata(95522).await;

    assert_eq!(metadata.sensor_id, 95522);
    assert_eq!(metadata.location, "Dhaka, BD");
    assert_eq!(metadata.lat, "23.81");
    assert_eq!(metadata.lon, "90.41");
}

/// Test that metadata lookup failures fall back to defaults instead of erroring
#[tokio::test]
async fn test_fetch_metadata_falls_back_on_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/airrohr/v1/sensor/95522/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let client = ArchiveClient::new(&archive_config(&server)).expect("Failed to create client");
    let metadata = client.fetch_metadata(95522).await;

    assert_eq!(metadata.location, "Sensor_95522");
    assert_eq!(metadata.lat, "0.0");
    assert_eq!(metadata.lon, "0.0");
}
