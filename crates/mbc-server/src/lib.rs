//! HTTP server for the MBC CQRS core.
//!
//! Exposes commands, item and history reads, CSV/ZIP imports, job status and
//! CSV export as a JSON API over one [`mbc_sdk::Cqrs`] instance.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::{AppConfig, ServerConfig, TableConfig};
pub use error::{ServerError, ServerResult};
pub use handler::AppState;
pub use server::MbcServer;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn app() -> Router {
        let config = AppConfig {
            tables: vec![TableConfig {
                name: "product".into(),
                kind: "PRODUCT".into(),
                required: vec!["price".into()],
            }],
            ..AppConfig::default()
        };
        MbcServer::new(config).unwrap().router()
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", "alice");
        let body = match body {
            Some(v) => {
                request = request.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (status, body) = send(&app(), Method::GET, "/v1/health", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn info_endpoint() {
        let (status, body) = send(&app(), Method::GET, "/v1/info", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["name"], "mbc-server");
        assert_eq!(body["tables"], json!(["product"]));
    }

    #[tokio::test]
    async fn publish_read_and_conflict() {
        let app = app();
        let command = |version: u64, price: u64| {
            json!({
                "pk": "PRODUCT#acme",
                "sk": "p1",
                "version": version,
                "name": "Pen",
                "attributes": { "price": price },
                "mode": "sync",
            })
        };

        let (status, created) = send(&app, Method::POST, "/v1/commands", Some(command(0, 10))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["version"], 1);
        assert_eq!(created["updatedBy"], "alice");

        let (status, _) = send(&app, Method::POST, "/v1/commands", Some(command(1, 12))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, conflict) = send(&app, Method::POST, "/v1/commands", Some(command(1, 99))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict["currentVersion"], 2);

        let (status, item) = send(&app, Method::GET, "/v1/items/PRODUCT%23acme/p1", None).await;
        assert_eq!(status, 200);
        assert_eq!(item["version"], 2);
        assert_eq!(item["attributes"]["price"], 12);

        let (_, page) = send(&app, Method::GET, "/v1/items/PRODUCT%23acme?limit=10", None).await;
        assert_eq!(page["items"].as_array().unwrap().len(), 1);

        let (_, versions) = send(&app, Method::GET, "/v1/history/PRODUCT%23acme/p1", None).await;
        assert_eq!(versions.as_array().unwrap().len(), 2);

        let (status, v1) = send(&app, Method::GET, "/v1/history/PRODUCT%23acme/p1/1", None).await;
        assert_eq!(status, 200);
        assert_eq!(v1["attributes"]["price"], 10);
    }

    #[tokio::test]
    async fn partial_update_and_missing_entity() {
        let app = app();
        let create = json!({"pk": "PRODUCT#acme", "sk": "p2", "name": "Ink", "mode": "sync"});
        send(&app, Method::POST, "/v1/commands", Some(create)).await;

        let patch = json!({"pk": "PRODUCT#acme", "sk": "p2", "attributes": {"price": 3}, "mode": "sync"});
        let (status, merged) = send(&app, Method::PATCH, "/v1/commands", Some(patch)).await;
        assert_eq!(status, 200);
        assert_eq!(merged["name"], "Ink");
        assert_eq!(merged["version"], 2);

        let missing = json!({"pk": "PRODUCT#acme", "sk": "nope"});
        let (status, _) = send(&app, Method::PATCH, "/v1/commands", Some(missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_command_is_a_bad_request() {
        let (status, body) = send(
            &app(),
            Method::POST,
            "/v1/commands",
            Some(json!({"pk": "no-separator", "sk": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("partition key"));
    }

    #[tokio::test]
    async fn missing_item_is_404() {
        let (status, _) = send(&app(), Method::GET, "/v1/items/PRODUCT%23acme/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn csv_import_then_job_and_export() {
        let app = app();
        let request = json!({
            "tableName": "product",
            "tenantCode": "acme",
            "content": "code,name,price\np1,Pen,10\np2,Ink,\np3,Pad,4\n",
        });
        let (status, job) = send(&app, Method::POST, "/v1/imports/csv", Some(request)).await;
        assert_eq!(status, 200);
        assert_eq!(job["status"], "FAILED");
        assert_eq!(job["processedRows"], 3);
        assert_eq!(job["failedRows"], 1);

        let id = job["id"].as_str().unwrap();
        let (status, fetched) = send(&app, Method::GET, &format!("/v1/jobs/{id}"), None).await;
        assert_eq!(status, 200);
        assert_eq!(fetched["id"], id);

        let (_, children) = send(&app, Method::GET, &format!("/v1/jobs/{id}/children"), None).await;
        let children = children.as_array().unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[1]["error"]["kind"], "validation");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/exports/PRODUCT%23acme?columns=price")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/csv; charset=utf-8");
    }

    #[tokio::test]
    async fn unknown_table_and_bad_archive() {
        let app = app();
        let request = json!({"tableName": "nope", "tenantCode": "acme", "content": "code\n"});
        let (status, _) = send(&app, Method::POST, "/v1/imports/csv", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/imports/zip?tenantCode=acme")
                    .body(Body::from("not a zip"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_update_rejects_finished_jobs() {
        let app = app();
        let request = json!({
            "tableName": "product",
            "tenantCode": "acme",
            "attributes": {"code": "p9", "price": "1"},
        });
        let (status, job) = send(&app, Method::POST, "/v1/imports", Some(request)).await;
        assert_eq!(status, 200);
        assert_eq!(job["status"], "COMPLETED");

        let id = job["id"].as_str().unwrap();
        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("/v1/jobs/{id}/status"),
            Some(json!({"status": "FAILED"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, Method::GET, "/v1/jobs/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
