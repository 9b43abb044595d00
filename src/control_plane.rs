//! Control-plane client: lines, node binding, ip rotation and the node catalog.

use crate::error::ControlPlaneError;
use crate::line::{Line, Node, NodeId, Province, TradeId};

use async_trait::async_trait;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time;
use url::Url;

const ACK_CODE: i64 = 1000;
const BIND_ACK_MSG: &str = "节点变更成功.";
const ROTATE_ACK_MSG: &str = "变更成功.";

/// Operations the monitor needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Every line visible to the caller. An empty list is an error.
    async fn list_lines(&self) -> Result<Vec<Line>, ControlPlaneError>;

    /// Bind the lines of `trade` to `node`.
    async fn bind_trade_to_node(&self, trade: TradeId, node: NodeId)
        -> Result<(), ControlPlaneError>;

    /// Ask for a fresh outbound ip on the line of `trade`.
    async fn rotate_outbound_ip(&self, trade: TradeId) -> Result<(), ControlPlaneError>;

    async fn list_provinces(&self) -> Result<Vec<Province>, ControlPlaneError>;

    async fn list_nodes(&self, province: i64) -> Result<Vec<Node>, ControlPlaneError>;
}

/// Rotation request for a trade followed by a fixed cooldown.
pub struct Rotation<'a> {
    pub control_plane: &'a dyn ControlPlane,
    pub trade: TradeId,
    pub cooldown: Duration,
}

impl Rotation<'_> {
    /// Rotate, then wait out the cooldown whether or not the call succeeded.
    pub async fn rotate(&self) -> bool {
        let result = self.control_plane.rotate_outbound_ip(self.trade).await;
        time::sleep(self.cooldown).await;
        match result {
            Ok(()) => {
                info!("Rotated outbound ip for trade {}", self.trade);
                true
            }
            Err(e) => {
                warn!("Failed to rotate outbound ip for trade {}: {}", self.trade, e);
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<Vec<T>>,
}

/// Response to calls whose payload is ignored.
#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl Ack {
    fn accepted(self, ack_msg: &str) -> Result<(), ControlPlaneError> {
        if self.code == ACK_CODE || self.msg == ack_msg {
            Ok(())
        } else {
            Err(ControlPlaneError::Rejected {
                code: self.code,
                msg: self.msg,
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct BindRequest {
    node_id: NodeId,
    trade_id: TradeId,
}

/// JSON-over-HTTP control plane.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base: Url,
    catalog_line_id: i64,
    catalog_project_id: i64,
}

impl HttpControlPlane {
    /// `base` is the API origin, e.g. `http://10.0.0.5:8080`.
    pub fn new(base: &str, timeout: Duration) -> Result<Self, ControlPlaneError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            catalog_line_id: 22,
            catalog_project_id: 592,
        })
    }

    /// Line type and project the node catalog is filtered by.
    pub fn with_catalog_filter(mut self, line_id: i64, project_id: i64) -> Self {
        self.catalog_line_id = line_id;
        self.catalog_project_id = project_id;
        self
    }

    fn endpoint(&self, name: &str) -> Result<Url, ControlPlaneError> {
        Ok(self.base.join("api/outApi/")?.join(name)?)
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<Vec<T>, ControlPlaneError> {
        let envelope: Envelope<T> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_lines(&self) -> Result<Vec<Line>, ControlPlaneError> {
        let lines = self.get_list::<Line>(self.endpoint("getLine")?).await?;
        if lines.is_empty() {
            return Err(ControlPlaneError::EmptyLines);
        }
        Ok(lines)
    }

    async fn bind_trade_to_node(
        &self,
        trade: TradeId,
        node: NodeId,
    ) -> Result<(), ControlPlaneError> {
        let ack: Ack = self
            .client
            .post(self.endpoint("changeNode")?)
            .json(&BindRequest {
                node_id: node,
                trade_id: trade,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        ack.accepted(BIND_ACK_MSG)
    }

    async fn rotate_outbound_ip(&self, trade: TradeId) -> Result<(), ControlPlaneError> {
        let mut url = self.endpoint("changeLineIpAddr")?;
        url.query_pairs_mut()
            .append_pair("line_id", &trade.to_string());
        let ack: Ack = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        ack.accepted(ROTATE_ACK_MSG)
    }

    async fn list_provinces(&self) -> Result<Vec<Province>, ControlPlaneError> {
        let provinces = self.get_list(self.endpoint("getProvinces")?).await?;
        Ok(provinces)
    }

    async fn list_nodes(&self, province: i64) -> Result<Vec<Node>, ControlPlaneError> {
        let mut url = self.endpoint("getNodes")?;
        url.query_pairs_mut()
            .append_pair("line_id", &self.catalog_line_id.to_string())
            .append_pair("project_id", &self.catalog_project_id.to_string())
            .append_pair("province_id", &province.to_string());
        let nodes = self.get_list(url).await?;
        Ok(nodes)
    }
}
