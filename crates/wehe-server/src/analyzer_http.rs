//! Legacy analyzer endpoint for clients older than v4.0.
//!
//! Analysis itself already ran inline on the legacy side channel; this
//! listener only acknowledges the POST old clients insist on sending and
//! serves the stored verdict to the follow-up GET. Responses are always
//! HTTP 200 with `success` carrying the real outcome, because that is what
//! the old clients parse.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_rustls::TlsAcceptor;

use crate::sidechannel::{AppState, ServerHandle};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/Results", get(results_get).post(results_post))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

/// Serve the router over TLS. `axum::serve` is plaintext-only, so each
/// accepted connection is handshaked and handed to hyper directly.
pub async fn start_analyzer(
    state: AppState,
    acceptor: TlsAcceptor,
) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(state.cfg.analyzer_addr).await?;
    let addr = listener.local_addr()?;
    let app = router(state);

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!("analyzer accept failed: {err}");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        let tls = match acceptor.accept(stream).await {
                            Ok(tls) => tls,
                            Err(err) => {
                                tracing::debug!(%peer, "analyzer TLS handshake failed: {err}");
                                return;
                            }
                        };
                        let service = hyper_util::service::TowerToHyperService::new(app);
                        let builder = hyper_util::server::conn::auto::Builder::new(
                            hyper_util::rt::TokioExecutor::new(),
                        );
                        if let Err(err) = builder
                            .serve_connection(hyper_util::rt::TokioIo::new(tls), service)
                            .await
                        {
                            tracing::debug!(%peer, "analyzer connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle::new(addr, shutdown_tx, task))
}

/// POST /Results. The old protocol expects this request to trigger the
/// analysis, but it already happened on the side channel; acknowledge.
async fn results_post() -> Json<Value> {
    Json(json!({"success": true}))
}

/// GET /Results?command=singleResult&userID=..&historyCount=..&testID=..
///
/// `historyCount` is what current clients call the test ID; the legacy
/// `testID` names a replay within the test by its replay-type code. The
/// session is dropped from the unanalyzed table once its result is read.
async fn results_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let command = match require(&params, "command") {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    if command != "singleResult" {
        return Json(json!({"success": false, "error": "unknown command"}));
    }

    let user_id = match require(&params, "userID") {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    let history_count = match require(&params, "historyCount") {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    let test_id_raw = match require(&params, "testID") {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    let Ok(replay_code) = test_id_raw.parse::<u8>() else {
        return Json(json!({"success": false, "error": "testID is not an integer"}));
    };
    let Ok(history_count_num) = history_count.parse::<i64>() else {
        return Json(json!({"success": false, "error": "No result found"}));
    };

    let Some(session) = state.registry.get_unanalyzed(user_id, history_count_num) else {
        return Json(json!({"success": false, "error": "No result found"}));
    };

    let response = {
        let session = session.lock().expect("session mutex");

        let Some(replay) = session
            .replays
            .iter()
            .find(|replay| replay.replay_type.code() == replay_code)
        else {
            return Json(json!({"success": false, "error": "No result found"}));
        };
        let Some(analysis) = &session.analysis else {
            return Json(json!({"success": false, "error": "No result found"}));
        };

        json!({
            "success": true,
            "response": {
                "replayName": replay.replay_name,
                "date": session.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                "userID": user_id,
                "extraString": session.extra_string,
                "historyCount": history_count,
                "testID": test_id_raw,
                "area_test": format!("{:.6}", analysis.area0var),
                "ks2_ratio_test": format!("{:.6}", analysis.jackknife_accept_ratio),
                "xput_avg_original": format!("{:.6}", analysis.original_stats.average),
                "xput_avg_test": format!("{:.6}", analysis.random_stats.average),
                "ks2dVal": format!("{:.6}", analysis.ks2_d),
                "ks2pVal": format!("{:.6}", analysis.ks2_p),
            }
        })
    };

    state.registry.remove_unanalyzed(user_id, history_count_num);
    Json(response)
}

fn require<'a>(
    params: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, Json<Value>> {
    match params.get(key).map(String::as_str).filter(|v| !v.is_empty()) {
        Some(value) => Ok(value),
        None => Err(Json(json!({
            "success": false,
            "error": format!("{key} not provided"),
        }))),
    }
}
