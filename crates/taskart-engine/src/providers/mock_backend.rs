//! wiremock server driven from blocking test code.

use serde_json::Value;
use tokio::runtime::Runtime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockBuilder, MockServer, Request, ResponseTemplate};

pub(crate) struct MockBackend {
    server: MockServer,
    runtime: Runtime,
}

impl MockBackend {
    pub fn start() -> anyhow::Result<Self> {
        let runtime = Runtime::new()?;
        let server = runtime.block_on(MockServer::start());
        Ok(Self { server, runtime })
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Answers one POST to `route`. Replies mounted for the same route are
    /// served in mount order.
    pub fn reply(&self, route: &str, status: u16, body: Value) {
        self.answer(post(route), ResponseTemplate::new(status).set_body_json(body));
    }

    pub fn answer(&self, mock: MockBuilder, template: ResponseTemplate) {
        let mock = mock.respond_with(template).up_to_n_times(1);
        self.runtime.block_on(mock.mount(&self.server));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.runtime
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }
}

pub(crate) fn post(route: &str) -> MockBuilder {
    Mock::given(method("POST")).and(path(route))
}

pub(crate) fn body_text(request: &Request) -> String {
    String::from_utf8_lossy(&request.body).to_string()
}
