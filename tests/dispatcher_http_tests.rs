//! HTTP Dispatcher 集成测试

#[cfg(feature = "agent")]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use scanfleet::agent::{Agent, DockerRunner};
    use scanfleet::config::AgentConfig;
    use scanfleet::dispatcher::{DispatcherApi, HttpDispatcher};
    use scanfleet::types::{AgentInfo, AgentStatus, JobCmd, Report, Session, SessionStatus, Step};
    use scanfleet::Error;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(server: &MockServer) -> HttpDispatcher {
        HttpDispatcher::new(server.uri(), Some("secret".to_string())).unwrap()
    }

    fn session_json(status: &str) -> serde_json::Value {
        json!({
            "id": "s1",
            "scan": "scan-1",
            "status": status,
            "step": {"plugin": "nmap", "config": {"ports": "80"}},
            "plugin": "nmap-1",
            "created": "2024-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_create_agent_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agents"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"id": "", "name": "w", "type": "docker", "status": "undefined"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "a1", "name": "w", "type": "docker", "status": "registered"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let agent = dispatcher(&server)
            .agents_create(&AgentInfo::new("w", "docker"))
            .await
            .unwrap();
        assert_eq!(agent.id, "a1");
        assert_eq!(agent.status, AgentStatus::Registered);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agents"))
            .respond_with(ResponseTemplate::new(409).set_body_string("agent exists"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/agents/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/agents/a1/jobs"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let api = dispatcher(&server);
        match api.agents_create(&AgentInfo::new("w", "docker")).await {
            Err(Error::Conflict(msg)) => assert_eq!(msg, "agent exists"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(api.agents_get("missing").await.unwrap_err().is_not_found());
        match api.agents_jobs("a1").await {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_agents_and_unknown_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/agents"))
            .and(query_param("name", "w"))
            .and(query_param("type", "docker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "a1", "name": "w", "type": "docker", "status": "retired"}
            ])))
            .mount(&server)
            .await;

        let agents = dispatcher(&server).agents_list("w", "docker").await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].status, AgentStatus::Unknown);
    }

    #[tokio::test]
    async fn test_jobs_and_session_routes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/agents/a1/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"cmd": "scan", "scan": session_json("queued")}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/scans/scan-1/sessions/s1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/scans/scan-1/sessions/s1/children"))
            .and(body_json(json!({"plugin": "httpx", "config": {}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "c1",
                "scan": "scan-1",
                "status": "created",
                "step": {"plugin": "httpx", "config": {}},
                "plugin": "",
                "parent": "s1",
                "created": "2024-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/scans/scan-1/sessions/s1/report"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = dispatcher(&server);
        let jobs = api.agents_jobs("a1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].cmd, JobCmd::Scan);

        let mut session: Session = jobs[0].scan.clone().unwrap();
        assert_eq!(session.status, SessionStatus::Queued);
        session.start().unwrap();
        api.session_update(&session).await.unwrap();

        let child = api
            .session_add_child(&session, &Step::new("httpx", json!({})))
            .await
            .unwrap();
        assert_eq!(child.parent.as_deref(), Some("s1"));

        api.session_report_submit(&session, &Report::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_plugin_and_file_routes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/plugins/nmap"))
            .and(query_param("version", "1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "nmap-1", "name": "nmap", "version": "1.0.0", "kind": "container",
                "image": "scanfleet/nmap:1.0.0"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/plugins"))
            .and(query_param("name", "nmap"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/files/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "out.txt", "data": "aGVsbG8="
            })))
            .mount(&server)
            .await;

        let api = dispatcher(&server);
        let plugin = api.plugins_get("nmap", Some("1.0.0")).await.unwrap();
        assert_eq!(plugin.image.as_deref(), Some("scanfleet/nmap:1.0.0"));
        assert!(api.plugins_list("nmap").await.unwrap().is_empty());

        let file = api.files_download("f1").await.unwrap();
        assert_eq!(file.data, b"hello");
    }

    #[tokio::test]
    async fn test_agent_backs_off_when_status_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agents"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "a1", "name": "w", "type": "docker"
            })))
            .mount(&server)
            .await;

        let config = AgentConfig {
            name: "w".to_string(),
            backoff: Duration::from_millis(20),
            ..AgentConfig::default()
        };
        let mut agent = Agent::new(
            config,
            Arc::new(dispatcher(&server)),
            Arc::new(DockerRunner::new("docker")),
        );

        let delay = agent.step(&CancellationToken::new()).await.unwrap();
        assert_eq!(agent.info().status, AgentStatus::Undefined);
        assert_eq!(delay, Duration::from_millis(20));
    }
}
