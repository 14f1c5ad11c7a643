//! Remote Plugin 协议集成测试

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scanfleet::config::PollIntervals;
use scanfleet::dispatcher::{DispatcherApi, LocalDispatcher};
use scanfleet::remote::{RemoteClient, RemoteServer};
use scanfleet::transport::Loop;
use scanfleet::types::{
    AgentInfo, FileBlob, Job, Plugin, PluginKind, Report, Scan, Session, SessionStatus, Step,
};
use scanfleet::{Error, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

fn fast_poll() -> PollIntervals {
    PollIntervals {
        poll: Duration::from_millis(10),
        error: Duration::from_millis(20),
        paused: Duration::from_millis(30),
    }
}

struct Fixture {
    dispatcher: Arc<LocalDispatcher>,
    agent: String,
    parent: Session,
}

/// 一个已批准的 Agent 和一个正在运行的根会话
async fn fixture() -> Fixture {
    let dispatcher = Arc::new(LocalDispatcher::new());
    let mut scan = Scan::new("scan-1", "recon", "example.org");
    scan.push_step("s1", Step::new("composite", json!({"target": "example.org", "depth": 2})));
    dispatcher.add_scan(scan);

    for version in ["1.0.0", "1.2.0"] {
        dispatcher.add_plugin(Plugin {
            id: format!("nmap-{}", version),
            name: "nmap".to_string(),
            version: version.to_string(),
            kind: PluginKind::Container,
            image: Some(format!("scanfleet/nmap:{}", version)),
            script: None,
            command: vec![],
        });
    }
    dispatcher.add_file(
        "wordlist",
        FileBlob {
            name: Some("words.txt".to_string()),
            data: b"admin\nroot\n".to_vec(),
        },
    );

    let agent = dispatcher
        .agents_create(&AgentInfo::new("worker", "script"))
        .await
        .unwrap();
    dispatcher.approve_agent(&agent.id).unwrap();

    let mut parent = dispatcher.agents_jobs(&agent.id).await.unwrap()[0]
        .scan
        .clone()
        .unwrap();
    parent.start().unwrap();
    dispatcher.session_update(&parent).await.unwrap();

    Fixture {
        dispatcher,
        agent: agent.id,
        parent,
    }
}

fn connect(
    fixture: &Fixture,
    cancel: &CancellationToken,
) -> (Arc<RemoteServer>, JoinHandle<scanfleet::Result<()>>, Arc<RemoteClient>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = Arc::new(
        RemoteServer::new(fixture.dispatcher.clone(), fixture.parent.clone(), cancel).with_poll(fast_poll()),
    );
    let running = tokio::spawn(server.clone().run(Loop::from_stream(a)));
    let client = Arc::new(RemoteClient::from_loop(Loop::from_stream(b)));
    (server, running, client)
}

/// 嵌套会话的执行结果
enum Outcome {
    Report(Report),
    /// 成功但不提交报告（容器插件）
    Silent,
    Fail,
}

/// 模拟另一个 Agent 领取并执行嵌套会话
async fn drive_child(dispatcher: &LocalDispatcher, agent: &str, outcome: Outcome) -> Session {
    loop {
        let jobs = dispatcher.agents_jobs(agent).await.unwrap();
        if let Some(job) = jobs.into_iter().next() {
            let mut child = job.scan.unwrap();
            child.start().unwrap();
            dispatcher.session_update(&child).await.unwrap();
            match outcome {
                Outcome::Report(report) => {
                    dispatcher.session_report_submit(&child, &report).await.unwrap();
                    child.finish().unwrap();
                }
                Outcome::Silent => child.finish().unwrap(),
                Outcome::Fail => child.fail().unwrap(),
            }
            dispatcher.session_update(&child).await.unwrap();
            return child;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn open_ports() -> Outcome {
    Outcome::Report(Report {
        data: json!({"open": [22, 443]}),
        files: vec![],
    })
}

#[tokio::test]
async fn test_wait_for_connection_and_basic_calls() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let (server, _running, client) = connect(&fixture, &cancel);

    let info = timeout(Duration::from_secs(1), client.wait_for_connection())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.session, "s1");
    assert_eq!(info.version, scanfleet::VERSION_FULL);

    client.ping().await.unwrap();
    assert_eq!(
        client.get_config().await.unwrap(),
        json!({"target": "example.org", "depth": 2})
    );
    assert_eq!(client.get_plugin("nmap").await.unwrap(), vec!["1.0.0", "1.2.0"]);
    assert!(client.get_plugin("zap").await.unwrap().is_empty());

    let file = client.download_file("wordlist").await.unwrap();
    assert_eq!(file.data, b"admin\nroot\n");
    assert!(matches!(client.download_file("missing").await, Err(Error::Remote(_))));

    let report = Report {
        data: json!({"hosts": 1}),
        files: vec!["wordlist".to_string()],
    };
    client.send_report(report.clone()).await.unwrap();
    assert_eq!(server.take_report(), Some(report));
    assert_eq!(server.take_report(), None);
}

#[tokio::test]
async fn test_run_plugin_returns_child_report() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let (_server, _running, client) = connect(&fixture, &cancel);
    client.wait_for_connection().await.unwrap();

    let calling = {
        let client = client.clone();
        tokio::spawn(async move { client.run_plugin(Step::new("nmap", json!({"ports": "1-1024"}))).await })
    };
    let child = drive_child(&fixture.dispatcher, &fixture.agent, open_ports()).await;

    let report = timeout(Duration::from_secs(2), calling).await.unwrap().unwrap().unwrap();
    assert_eq!(report.data, json!({"open": [22, 443]}));

    let stored = fixture.dispatcher.session_get("scan-1", &child.id).await.unwrap();
    assert_eq!(stored.parent.as_deref(), Some("s1"));
    assert_eq!(stored.status, SessionStatus::Finished);
    // 父会话与 Scan 仍在运行
    assert_eq!(fixture.dispatcher.scan("scan-1").unwrap().status, SessionStatus::Working);
}

#[tokio::test]
async fn test_run_plugin_child_failure() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let (_server, _running, client) = connect(&fixture, &cancel);
    client.wait_for_connection().await.unwrap();

    let calling = {
        let client = client.clone();
        tokio::spawn(async move { client.run_plugin(Step::new("nmap", json!({}))).await })
    };
    let child = drive_child(&fixture.dispatcher, &fixture.agent, Outcome::Fail).await;

    let result = timeout(Duration::from_secs(2), calling).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Remote(_))));
    assert!(fixture.dispatcher.report(&child.id).is_none());
}

#[tokio::test]
async fn test_server_run_plugin_reports_child_failed() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let server = RemoteServer::new(fixture.dispatcher.clone(), fixture.parent.clone(), &cancel)
        .with_poll(fast_poll());

    let driver = {
        let dispatcher = fixture.dispatcher.clone();
        let agent = fixture.agent.clone();
        tokio::spawn(async move { drive_child(&dispatcher, &agent, Outcome::Fail).await })
    };

    let result = server.run_plugin(&Step::new("nmap", json!({})), &cancel).await;
    let child = driver.await.unwrap();
    match result {
        Err(Error::ChildFailed(id)) => assert_eq!(id, child.id),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_run_plugin_child_without_report() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let server = RemoteServer::new(fixture.dispatcher.clone(), fixture.parent.clone(), &cancel)
        .with_poll(fast_poll());

    let driver = {
        let dispatcher = fixture.dispatcher.clone();
        let agent = fixture.agent.clone();
        tokio::spawn(async move { drive_child(&dispatcher, &agent, Outcome::Silent).await })
    };

    let report = timeout(
        Duration::from_secs(2),
        server.run_plugin(&Step::new("nmap", json!({})), &cancel),
    )
    .await
    .unwrap()
    .unwrap();
    let child = driver.await.unwrap();

    assert_eq!(report, Report::default());
    assert!(fixture.dispatcher.report(&child.id).is_none());
}

#[tokio::test]
async fn test_server_run_plugin_cancel() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let server = RemoteServer::new(fixture.dispatcher.clone(), fixture.parent.clone(), &cancel)
        .with_poll(fast_poll());

    let caller = CancellationToken::new();
    {
        let caller = caller.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            caller.cancel();
        });
    }

    // 没有人执行子会话，只能等到取消
    let result = timeout(
        Duration::from_secs(1),
        server.run_plugin(&Step::new("nmap", json!({})), &caller),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_client_close_ends_server() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();
    let (_server, running, client) = connect(&fixture, &cancel);
    client.wait_for_connection().await.unwrap();

    client.close();
    let result = timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/// 按脚本返回子会话状态，并记录每次轮询的时间
struct ScriptedDispatcher {
    child: Session,
    polls: Mutex<VecDeque<Result<SessionStatus>>>,
    started: Instant,
    seen: Mutex<Vec<Duration>>,
}

#[async_trait]
impl DispatcherApi for ScriptedDispatcher {
    async fn agents_create(&self, _agent: &AgentInfo) -> Result<AgentInfo> {
        unimplemented!()
    }
    async fn agents_list(&self, _name: &str, _agent_type: &str) -> Result<Vec<AgentInfo>> {
        unimplemented!()
    }
    async fn agents_get(&self, _id: &str) -> Result<AgentInfo> {
        unimplemented!()
    }
    async fn agents_update(&self, _agent: &AgentInfo) -> Result<AgentInfo> {
        unimplemented!()
    }
    async fn agents_jobs(&self, _agent_id: &str) -> Result<Vec<Job>> {
        unimplemented!()
    }
    async fn plugins_get(&self, _name: &str, _version: Option<&str>) -> Result<Plugin> {
        unimplemented!()
    }
    async fn plugins_list(&self, _name: &str) -> Result<Vec<Plugin>> {
        unimplemented!()
    }
    async fn session_update(&self, _session: &Session) -> Result<()> {
        unimplemented!()
    }

    async fn session_add_child(&self, _parent: &Session, _step: &Step) -> Result<Session> {
        Ok(self.child.clone())
    }

    async fn session_get(&self, _scan: &str, _session: &str) -> Result<Session> {
        self.seen.lock().push(self.started.elapsed());
        let status = self
            .polls
            .lock()
            .pop_front()
            .unwrap_or(Ok(SessionStatus::Finished))?;
        let mut child = self.child.clone();
        child.status = status;
        Ok(child)
    }

    async fn session_report_get(&self, _scan: &str, session: &str) -> Result<Report> {
        Err(Error::NotFound(format!("report for session {}", session)))
    }

    async fn session_report_submit(&self, _session: &Session, _report: &Report) -> Result<()> {
        unimplemented!()
    }
    async fn files_download(&self, _id: &str) -> Result<FileBlob> {
        unimplemented!()
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_plugin_poll_intervals() {
    let fixture = fixture().await;
    let mut child = fixture.parent.clone();
    child.id = "c1".to_string();
    child.parent = Some(fixture.parent.id.clone());
    child.status = SessionStatus::Created;

    let dispatcher = Arc::new(ScriptedDispatcher {
        child,
        polls: Mutex::new(VecDeque::from([
            Err(Error::Transport("dispatcher unreachable".to_string())),
            Ok(SessionStatus::Paused),
            Ok(SessionStatus::Working),
            Ok(SessionStatus::Finished),
        ])),
        started: Instant::now(),
        seen: Mutex::new(Vec::new()),
    });
    let cancel = CancellationToken::new();
    let server = RemoteServer::new(dispatcher.clone(), fixture.parent.clone(), &cancel);

    let report = server
        .run_plugin(&Step::new("nmap", json!({})), &cancel)
        .await
        .unwrap();
    assert_eq!(report, Report::default());

    // 默认间隔：首轮 2s，出错后 15s，暂停时 30s，其余 2s
    let secs: Vec<u64> = dispatcher.seen.lock().iter().map(|d| d.as_secs()).collect();
    assert_eq!(secs, vec![2, 17, 47, 49]);
}
