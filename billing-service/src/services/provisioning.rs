//! RouterOS access provisioning client.
//!
//! Talks to a MikroTik RouterOS REST API to create and remove hotspot and
//! PPPoE users keyed on the subscriber's phone number. Static-IP leases are
//! reserved by MAC address out of band, so for that connection type the
//! engine only records the request.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;

use crate::billing::payment::AccessProvisioner;
use crate::config::RouterOsConfig;
use crate::models::{ConnectionType, Subscriber};

#[derive(Clone)]
pub struct RouterOsProvisioner {
    client: Client,
    config: RouterOsConfig,
}

impl RouterOsProvisioner {
    pub fn new(config: RouterOsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    async fn api_get(&self, endpoint: &str) -> Result<serde_json::Value, AppError> {
        let response = self
            .client
            .get(self.url(endpoint))
            .basic_auth(
                &self.config.username,
                Some(self.config.password.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("RouterOS request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::BadGateway(format!("RouterOS request rejected: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("RouterOS response invalid: {}", e)))
    }

    async fn api_post(&self, endpoint: &str, body: serde_json::Value) -> Result<(), AppError> {
        self.client
            .post(self.url(endpoint))
            .basic_auth(
                &self.config.username,
                Some(self.config.password.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("RouterOS request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::BadGateway(format!("RouterOS request rejected: {}", e)))?;

        Ok(())
    }

    async fn api_delete(&self, endpoint: &str) -> Result<(), AppError> {
        self.client
            .delete(self.url(endpoint))
            .basic_auth(
                &self.config.username,
                Some(self.config.password.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("RouterOS request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::BadGateway(format!("RouterOS request rejected: {}", e)))?;

        Ok(())
    }

    /// Remove the entry whose `name` matches, if present.
    async fn remove_by_name(
        &self,
        list_endpoint: &str,
        remove_endpoint: &str,
        name: &str,
    ) -> Result<(), AppError> {
        let entries = self.api_get(list_endpoint).await?;
        let entries = entries.as_array().cloned().unwrap_or_default();

        for entry in entries {
            if entry.get("name").and_then(|n| n.as_str()) == Some(name) {
                if let Some(id) = entry.get(".id").and_then(|i| i.as_str()) {
                    self.api_delete(&format!("{}?=.id={}", remove_endpoint, id))
                        .await?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl AccessProvisioner for RouterOsProvisioner {
    async fn enable_access(
        &self,
        subscriber: &Subscriber,
        connection: ConnectionType,
    ) -> Result<(), AppError> {
        match connection {
            ConnectionType::Hotspot => {
                self.api_post(
                    "/ip/hotspot/user/add",
                    json!({
                        "name": subscriber.phone,
                        "password": subscriber.phone,
                        "server": "hotspot1",
                        "profile": "default",
                    }),
                )
                .await
            }
            ConnectionType::Pppoe => {
                self.api_post(
                    "/ppp/secret/add",
                    json!({
                        "name": subscriber.phone,
                        "password": subscriber.phone,
                        "profile": "default",
                        "service": "pppoe",
                    }),
                )
                .await
            }
            ConnectionType::StaticIp => {
                tracing::info!(
                    phone = %subscriber.phone,
                    "Static lease enablement is managed out of band"
                );
                Ok(())
            }
        }
    }

    async fn disable_access(
        &self,
        subscriber: &Subscriber,
        connection: ConnectionType,
    ) -> Result<(), AppError> {
        match connection {
            ConnectionType::Hotspot => {
                self.remove_by_name(
                    "/ip/hotspot/user/print",
                    "/ip/hotspot/user/remove",
                    &subscriber.phone,
                )
                .await
            }
            ConnectionType::Pppoe => {
                self.remove_by_name("/ppp/secret/print", "/ppp/secret/remove", &subscriber.phone)
                    .await
            }
            ConnectionType::StaticIp => {
                tracing::info!(
                    phone = %subscriber.phone,
                    "Static lease removal is managed out of band"
                );
                Ok(())
            }
        }
    }
}
