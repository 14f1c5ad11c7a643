//! HTTP + JSON Dispatcher 客户端

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::DispatcherApi;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::types::{AgentInfo, FileBlob, Job, Plugin, Report, Session, Step};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 基于 reqwest 的 Dispatcher 客户端
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token,
        }
    }

    /// 使用 Agent 配置（地址、token、自定义 CA）
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(ca) = &config.tls.ca_file {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self::with_client(
            builder.build()?,
            &config.dispatcher_url,
            config.token.clone(),
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = self.authorize(builder).send().await?;
        check(resp).await
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        Ok(self.send(builder).await?.json().await?)
    }
}

/// 409 / 404 与其他失败分开
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = resp.text().await.unwrap_or_default();
    let message = if message.is_empty() {
        status.to_string()
    } else {
        message
    };
    tracing::debug!("dispatcher replied {}: {}", status, message);

    Err(match status {
        StatusCode::CONFLICT => Error::Conflict(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        _ => Error::Api {
            status: status.as_u16(),
            message,
        },
    })
}

fn session_path(scan: &str, session: &str) -> String {
    format!("/api/scans/{}/sessions/{}", scan, session)
}

#[async_trait]
impl DispatcherApi for HttpDispatcher {
    async fn agents_create(&self, agent: &AgentInfo) -> Result<AgentInfo> {
        self.fetch(self.client.post(self.url("/api/agents")).json(agent))
            .await
    }

    async fn agents_list(&self, name: &str, agent_type: &str) -> Result<Vec<AgentInfo>> {
        self.fetch(
            self.client
                .get(self.url("/api/agents"))
                .query(&[("name", name), ("type", agent_type)]),
        )
        .await
    }

    async fn agents_get(&self, id: &str) -> Result<AgentInfo> {
        self.fetch(self.client.get(self.url(&format!("/api/agents/{}", id))))
            .await
    }

    async fn agents_update(&self, agent: &AgentInfo) -> Result<AgentInfo> {
        self.fetch(
            self.client
                .put(self.url(&format!("/api/agents/{}", agent.id)))
                .json(agent),
        )
        .await
    }

    async fn agents_jobs(&self, agent_id: &str) -> Result<Vec<Job>> {
        self.fetch(self.client.get(self.url(&format!("/api/agents/{}/jobs", agent_id))))
            .await
    }

    async fn plugins_get(&self, name: &str, version: Option<&str>) -> Result<Plugin> {
        let mut builder = self.client.get(self.url(&format!("/api/plugins/{}", name)));
        if let Some(version) = version {
            builder = builder.query(&[("version", version)]);
        }
        self.fetch(builder).await
    }

    async fn plugins_list(&self, name: &str) -> Result<Vec<Plugin>> {
        self.fetch(self.client.get(self.url("/api/plugins")).query(&[("name", name)]))
            .await
    }

    async fn session_update(&self, session: &Session) -> Result<()> {
        self.send(
            self.client
                .put(self.url(&session_path(&session.scan, &session.id)))
                .json(session),
        )
        .await?;
        Ok(())
    }

    async fn session_add_child(&self, parent: &Session, step: &Step) -> Result<Session> {
        let path = format!("{}/children", session_path(&parent.scan, &parent.id));
        self.fetch(self.client.post(self.url(&path)).json(step)).await
    }

    async fn session_get(&self, scan: &str, session: &str) -> Result<Session> {
        self.fetch(self.client.get(self.url(&session_path(scan, session))))
            .await
    }

    async fn session_report_get(&self, scan: &str, session: &str) -> Result<Report> {
        let path = format!("{}/report", session_path(scan, session));
        self.fetch(self.client.get(self.url(&path))).await
    }

    async fn session_report_submit(&self, session: &Session, report: &Report) -> Result<()> {
        let path = format!("{}/report", session_path(&session.scan, &session.id));
        self.send(self.client.post(self.url(&path)).json(report))
            .await?;
        Ok(())
    }

    async fn files_download(&self, id: &str) -> Result<FileBlob> {
        self.fetch(self.client.get(self.url(&format!("/api/files/{}", id))))
            .await
    }
}
