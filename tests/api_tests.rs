//! End-to-end tests for the HTTP API: a real router on an ephemeral port, a
//! local file server for volumes, a threshold model and in-memory storage.

mod common;

use common::*;
use ct_lesion_service::gcs::GcsStore;
use ct_lesion_service::overlay::Plane;
use ct_lesion_service::storage::MemoryStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const PUBLIC_PREFIX: &str = "https://storage.googleapis.com/tomographies/";

fn object_of(url: &str) -> &str {
    url.strip_prefix(PUBLIC_PREFIX).expect("public URL pattern")
}

/// Decode an uploaded overlay and count its pure red pixels.
fn red_pixels(store: &MemoryStore, url: &str) -> (u32, u32, usize) {
    let stored = store.get(object_of(url)).expect("uploaded object");
    assert_eq!(stored.content_type, "image/png");
    let img = image::load_from_memory(&stored.bytes).unwrap().to_rgb8();
    let red = img.pixels().filter(|p| p.0 == [255, 0, 0]).count();
    (img.width(), img.height(), red)
}

#[tokio::test]
async fn test_single_voxel_lesion_selects_its_slices() {
    let scan = scan_with_lesions((8, 9, 10), &[[2, 5, 7]]);
    let url = serve_file("/scan.nii", nifti_bytes(&scan, NATIVE_SPACING, None)).await;

    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store.clone()).await;

    let response = app.segment(&url).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    for plane in ["axial", "coronal", "sagittal"] {
        let urls = body[plane].as_array().unwrap();
        assert_eq!(urls.len(), 1, "{}", plane);
        let url = urls[0].as_str().unwrap();
        assert!(url.starts_with(&format!("{}ct-overlays/{}/", PUBLIC_PREFIX, plane)));
        assert!(url.ends_with(".png"));
    }

    // Axial slice z=7 is an 8x9 image (rows = x); the lesion sits at row 2, col 5.
    let axial = body["axial"][0].as_str().unwrap();
    let stored = store.get(object_of(axial)).unwrap();
    let img = image::load_from_memory(&stored.bytes).unwrap().to_rgb8();
    assert_eq!(img.dimensions(), (9, 8));
    assert_eq!(img.get_pixel(5, 2).0, [255, 0, 0]);
    let gray = img.get_pixel(0, 0).0;
    assert_eq!(gray[0], gray[1]);
    assert_eq!(gray[1], gray[2]);

    let (w, h, red) = red_pixels(&store, body["sagittal"][0].as_str().unwrap());
    assert_eq!((w, h, red), (10, 9, 1));

    // one upload per overlay, scratch files cleaned up
    assert_eq!(store.len(), 3);
    assert_eq!(app.scratch_entries(), 0);
}

#[tokio::test]
async fn test_axial_slices_ordered_by_lesion_area() {
    // axial areas: z=1 → 3, z=4 → 5, z=6 → 1, z=8 → 2
    let mut lesions = Vec::new();
    for x in 0..3 {
        lesions.push([x, 0, 1]);
    }
    for x in 0..5 {
        lesions.push([x, 4, 4]);
    }
    lesions.push([7, 7, 6]);
    lesions.push([6, 8, 8]);
    lesions.push([7, 8, 8]);

    let scan = scan_with_lesions((8, 9, 10), &lesions);
    let url = serve_file("/scan.nii.gz", gzip(&nifti_bytes(&scan, NATIVE_SPACING, None))).await;

    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store.clone()).await;

    let body: Value = app.segment(&url).await.json().await.unwrap();
    let axial: Vec<&str> = body["axial"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(axial.len(), 3);

    let areas: Vec<usize> = axial.iter().map(|u| red_pixels(&store, u).2).collect();
    assert_eq!(areas, vec![5, 3, 2]);

    for plane in Plane::ALL {
        let urls = body[plane.as_str()].as_array().unwrap();
        assert!(urls.len() <= 3);
        for u in urls {
            assert!(red_pixels(&store, u.as_str().unwrap()).2 > 0);
        }
    }
}

#[tokio::test]
async fn test_lesion_free_scan_returns_empty_planes() {
    let scan = scan_with_lesions((6, 6, 6), &[]);
    let url = serve_file("/clean.nii", nifti_bytes(&scan, NATIVE_SPACING, None)).await;

    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store.clone()).await;

    let response = app.segment(&url).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "axial": [], "coronal": [], "sagittal": [] }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_concurrent_request_is_rejected_as_busy() {
    let scan = scan_with_lesions((6, 6, 6), &[[1, 1, 1]]);
    let url = serve_file("/scan.nii", nifti_bytes(&scan, NATIVE_SPACING, None)).await;

    let (segmenter, release) = GatedSegmenter::new();
    let entered = segmenter.entered.clone();
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = Arc::new(spawn_app(Arc::new(segmenter), store.clone()).await);

    let first = {
        let app = app.clone();
        let url = url.clone();
        tokio::spawn(async move { app.segment(&url).await })
    };
    tokio::time::timeout(Duration::from_secs(10), entered.notified())
        .await
        .expect("first request reached inference");

    let second = app.segment(&url).await;
    assert_eq!(second.status(), 429);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "detail": "Busy" }));

    let health = app.health().await;
    assert_eq!(health["busy"], true);
    assert_eq!(health["admitted"], 1);
    assert_eq!(health["rejected"], 1);

    release.send(()).unwrap();
    let first = first.await.unwrap();
    assert_eq!(first.status(), 200);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["axial"].as_array().unwrap().len(), 1);

    // gate released once the first pipeline finished
    release.send(()).unwrap();
    assert_eq!(app.segment(&url).await.status(), 200);
}

#[tokio::test]
async fn test_pipeline_timeout_answers_500_but_keeps_gate() {
    let scan = scan_with_lesions((6, 6, 6), &[[2, 2, 2]]);
    let url = serve_file("/scan.nii", nifti_bytes(&scan, NATIVE_SPACING, None)).await;

    let (segmenter, release) = GatedSegmenter::new();
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app_with_timeout(Arc::new(segmenter), store.clone(), Some(1)).await;

    let timed_out = app.segment(&url).await;
    assert_eq!(timed_out.status(), 500);
    let body: Value = timed_out.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "detail": "Timed out after 1 seconds" }));

    // the abandoned pipeline is still blocked in inference and holds the gate
    let busy = app.segment(&url).await;
    assert_eq!(busy.status(), 429);

    release.send(()).unwrap();
    app.wait_until_idle().await;
    // the abandoned run still uploads its overlays
    assert_eq!(store.len(), 3);

    release.send(()).unwrap();
    let response = app.segment(&url).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["axial"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bad_url_is_500_and_releases_gate() {
    let scan = scan_with_lesions((6, 6, 6), &[[3, 3, 3]]);
    let good = serve_file("/scan.nii", nifti_bytes(&scan, NATIVE_SPACING, None)).await;
    let missing = good.replace("/scan.nii", "/missing.nii");

    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;

    for url in ["not-a-url", missing.as_str()] {
        let response = app.segment(url).await;
        assert_eq!(response.status(), 500, "{}", url);
        let body: Value = response.json().await.unwrap();
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Download failed"), "{}", detail);
    }

    assert_eq!(app.segment(&good).await.status(), 200);
}

#[tokio::test]
async fn test_unreadable_volume_is_500() {
    let url = serve_file("/garbage.nii", b"definitely not a nifti file".to_vec()).await;
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;

    let response = app.segment(&url).await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().starts_with("Invalid volume"));
    assert_eq!(app.scratch_entries(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_422() {
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;
    let endpoint = format!("{}/segment", app.base_url);

    let missing_field = app
        .client
        .post(&endpoint)
        .json(&serde_json::json!({ "url": "http://example.com/scan.nii" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_field.status(), 422);
    let body: Value = missing_field.json().await.unwrap();
    assert!(body["detail"].is_string());

    let not_json = app
        .client
        .post(&endpoint)
        .header("content-type", "application/json")
        .body("{image_url")
        .send()
        .await
        .unwrap();
    assert_eq!(not_json.status(), 422);
}

#[tokio::test]
async fn test_health_reports_model_and_device() {
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;

    let response = app
        .client
        .get(format!("{}/health", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "status": "ok",
            "busy": false,
            "model_loaded": true,
            "device": "cpu",
            "admitted": 0,
            "rejected": 0
        })
    );
}

#[tokio::test]
async fn test_metrics_endpoint_exports_counters() {
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;
    app.segment("not-a-url").await;

    let text = app
        .client
        .get(format!("{}/metrics", app.base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("segment_requests_total"));
}

#[tokio::test]
async fn test_upload_url_requires_gcs_backend() {
    let store = Arc::new(MemoryStore::new("tomographies"));
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;

    let response = app
        .client
        .post(format!("{}/upload-url", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("gcs"));
}

#[tokio::test]
async fn test_upload_url_signed_with_service_account() {
    let mut storage = ct_lesion_service::config::StorageConfig::memory();
    storage.credentials_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/service_account.json").into();
    let store = Arc::new(GcsStore::new(&storage).unwrap());
    let app = spawn_app(Arc::new(ThresholdSegmenter::default()), store).await;

    let response = app
        .client
        .post(format!("{}/upload-url", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    let public = body["publicUrl"].as_str().unwrap();
    assert!(public.starts_with(PUBLIC_PREFIX) && public.ends_with(".gz"));
    let object = object_of(public);

    let signed = body["url"].as_str().unwrap();
    assert!(signed.starts_with(&format!("{}{}?", PUBLIC_PREFIX, object)));
    assert!(signed.contains("X-Goog-Algorithm=GOOG4-RSA-SHA256"));
    assert!(signed.contains("X-Goog-Expires=3600"));
    assert!(signed.contains("X-Goog-SignedHeaders=content-type%3Bhost"));
    assert!(signed.contains("&X-Goog-Signature="));
}
