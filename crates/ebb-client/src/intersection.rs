//! Finding the common point between the local candidates and the remote chain.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use ebb_core::constants::methods;
use ebb_core::{ClientError, Intersection, IntersectionOutcome, Point};

use crate::query::QueryClient;

#[derive(Debug, Clone)]
pub struct IntersectionNegotiator {
    query: Arc<QueryClient>,
}

impl IntersectionNegotiator {
    pub fn new(query: Arc<QueryClient>) -> Self {
        Self { query }
    }

    /// Ask the remote for the best intersection with `points`, in caller order.
    ///
    /// With no points the remote's current tip becomes the only candidate.
    pub async fn find_intersection(&self, points: Vec<Point>) -> Result<Intersection, ClientError> {
        let points = if points.is_empty() {
            let tip = self.query.current_tip().await?;
            debug!(%tip, "no candidate points, starting from current tip");
            vec![tip.point()]
        } else {
            points
        };

        let response = self
            .query
            .request(methods::FIND_INTERSECT, Some(json!({ "points": points })))
            .await?;
        match IntersectionOutcome::from_result(response.into_result()?)? {
            IntersectionOutcome::Found(intersection) => {
                info!(point = %intersection.point, tip = %intersection.tip, "intersection found");
                Ok(intersection)
            }
            IntersectionOutcome::NotFound { tip } => {
                warn!(candidates = points.len(), %tip, "intersection not found");
                Err(ClientError::IntersectionNotFound { tip })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use crate::query::QueryOptions;
    use ebb_core::{Response, Tip};

    fn tip() -> Tip {
        Tip::Block {
            slot: 40,
            hash: "ff".into(),
            block_no: 9,
        }
    }

    fn point(slot: u64) -> Point {
        Point::Block {
            slot,
            hash: format!("{slot:02x}"),
        }
    }

    fn negotiator(conn: &Arc<MemoryConnection>) -> IntersectionNegotiator {
        IntersectionNegotiator::new(Arc::new(QueryClient::new(conn.clone(), QueryOptions::default())))
    }

    #[tokio::test]
    async fn candidates_are_sent_in_caller_order() {
        let conn = MemoryConnection::with_responder(|request| {
            vec![
                Response::success(
                    &request.methodname,
                    json!({ "IntersectionFound": { "point": point(20), "tip": tip() } }),
                )
                .with_reflection(request.mirror.clone()),
            ]
        });
        let found = negotiator(&conn)
            .find_intersection(vec![point(30), point(20), Point::Origin])
            .await
            .unwrap();
        assert_eq!(found.point, point(20));
        assert_eq!(found.tip, tip());

        let sent = conn.sent_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].methodname, methods::FIND_INTERSECT);
        assert_eq!(
            sent[0].args,
            Some(json!({ "points": [point(30), point(20), "origin"] }))
        );
    }

    #[tokio::test]
    async fn not_found_carries_remote_tip() {
        let conn = MemoryConnection::with_responder(|request| {
            vec![
                Response::success(&request.methodname, json!({ "IntersectionNotFound": { "tip": tip() } }))
                    .with_reflection(request.mirror.clone()),
            ]
        });
        let err = negotiator(&conn).find_intersection(vec![point(1)]).await.unwrap_err();
        match err {
            ClientError::IntersectionNotFound { tip: remote } => assert_eq!(remote, tip()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn origin_tip_projects_to_origin_point() {
        let conn = MemoryConnection::with_responder(|request| {
            let result = if request.methodname == methods::QUERY {
                json!("origin")
            } else {
                json!({ "IntersectionFound": { "point": "origin", "tip": "origin" } })
            };
            vec![Response::success(&request.methodname, result).with_reflection(request.mirror.clone())]
        });
        let found = negotiator(&conn).find_intersection(Vec::new()).await.unwrap();
        assert_eq!(found.point, Point::Origin);
        assert_eq!(found.tip, Tip::Origin);
        assert_eq!(conn.sent_requests()[1].args, Some(json!({ "points": ["origin"] })));
    }

    #[tokio::test]
    async fn unexpected_shape_is_protocol_error() {
        let conn = MemoryConnection::with_responder(|request| {
            vec![Response::success(&request.methodname, json!({ "Surprise": {} })).with_reflection(request.mirror.clone())]
        });
        let err = negotiator(&conn).find_intersection(vec![point(1)]).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
