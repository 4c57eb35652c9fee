use crate::api::{ApiResult, ApiTags};
use crate::auth::{ApiKeySecurity, AuthService};
use crate::model::{RegisterNodeRequest, RegisterNodeResponse};
use crate::service::node::NodeService;
use ffrtmp_common::model::{Empty, Node, NodeId};
use ffrtmp_common::recorded_http_api_request;
use poem::Request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct NodeApi {
    pub auth_service: Arc<dyn AuthService>,
    pub node_service: Arc<dyn NodeService>,
}

#[OpenApi(prefix_path = "/v1/nodes", tag = ApiTags::Node)]
impl NodeApi {
    /// Register a worker node
    ///
    /// Records the node as available and returns its assigned id.
    #[oai(path = "/register", method = "post", operation_id = "register_node")]
    async fn register_node(
        &self,
        request: &Request,
        data: Json<RegisterNodeRequest>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<RegisterNodeResponse>> {
        let record = recorded_http_api_request!("register_node", address = data.address.clone());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let node = self
                .node_service
                .register(auth.tenant_id(), &data.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(RegisterNodeResponse { node_id: node.id }))
        };
        record.result(response)
    }

    /// Node keepalive
    ///
    /// Refreshes the node's last_seen timestamp. Idempotent.
    #[oai(
        path = "/:node_id/heartbeat",
        method = "post",
        operation_id = "heartbeat"
    )]
    async fn heartbeat(
        &self,
        request: &Request,
        node_id: Path<NodeId>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Empty>> {
        let record = recorded_http_api_request!("heartbeat", node_id = node_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            self.node_service
                .heartbeat(auth.tenant_id(), &node_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };
        record.result(response)
    }

    /// Deregister a node
    ///
    /// Marks the node offline and returns its in-flight jobs to the queue.
    #[oai(path = "/:node_id", method = "delete", operation_id = "deregister_node")]
    async fn deregister_node(
        &self,
        request: &Request,
        node_id: Path<NodeId>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Empty>> {
        let record =
            recorded_http_api_request!("deregister_node", node_id = node_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            self.node_service
                .deregister(auth.tenant_id(), &node_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(Empty {}))
        };
        record.result(response)
    }

    /// List nodes of the calling tenant
    #[oai(path = "/", method = "get", operation_id = "list_nodes")]
    async fn list_nodes(
        &self,
        request: &Request,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Vec<Node>>> {
        let record = recorded_http_api_request!("list_nodes");
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let nodes = self
                .node_service
                .list(auth.tenant_id())
                .instrument(record.span.clone())
                .await?;
            Ok(Json(nodes))
        };
        record.result(response)
    }

    /// Fetch one node
    #[oai(path = "/:node_id", method = "get", operation_id = "get_node")]
    async fn get_node(
        &self,
        request: &Request,
        node_id: Path<NodeId>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Node>> {
        let record = recorded_http_api_request!("get_node", node_id = node_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let node = self
                .node_service
                .get(auth.tenant_id(), &node_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(node))
        };
        record.result(response)
    }
}
