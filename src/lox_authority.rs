//! LoxAuthority wire client (§6): one POST procedure per credential
//! operation. Request/response bodies are opaque JSON produced and
//! consumed by `CredentialEngine` — this client's only job is to POST
//! the right procedure and detect the `{"error": "..."}` envelope the
//! authority uses to signal a rejected request.

use serde_json::Value;

use crate::error::{AppError, Result};
use crate::fetch::FetchChannel;

pub struct LoxAuthorityClient {
    channel: FetchChannel,
}

impl LoxAuthorityClient {
    pub fn new(channel: FetchChannel) -> Self {
        Self { channel }
    }

    async fn call(&self, bootstrapped: bool, procedure: &str, body: Option<&str>) -> Result<String> {
        let text = self.channel.fetch(bootstrapped, procedure, body).await?;
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) {
            if let Some(err) = map.get("error").and_then(|v| v.as_str()) {
                return Err(AppError::ProcedureError(err.to_string()));
            }
        }
        Ok(text)
    }

    pub async fn invite(&self, bootstrapped: bool) -> Result<String> {
        self.call(bootstrapped, "invite", None).await
    }

    pub async fn openreq(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "openreq", Some(request)).await
    }

    pub async fn pubkeys(&self, bootstrapped: bool) -> Result<String> {
        self.call(bootstrapped, "pubkeys", None).await
    }

    pub async fn reachability(&self, bootstrapped: bool) -> Result<String> {
        self.call(bootstrapped, "reachability", None).await
    }

    pub async fn constants(&self, bootstrapped: bool) -> Result<String> {
        self.call(bootstrapped, "constants", None).await
    }

    pub async fn issueinvite(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "issueinvite", Some(request)).await
    }

    pub async fn levelup(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "levelup", Some(request)).await
    }

    pub async fn trustpromo(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "trustpromo", Some(request)).await
    }

    pub async fn trustmig(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "trustmig", Some(request)).await
    }

    pub async fn checkblockage(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "checkblockage", Some(request)).await
    }

    pub async fn blockagemigration(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "blockagemigration", Some(request))
            .await
    }

    pub async fn updatecred(&self, bootstrapped: bool, request: &str) -> Result<String> {
        self.call(bootstrapped, "updatecred", Some(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FakeHttpTransport;
    use serde_json::json;
    use std::rc::Rc;

    fn channel_with(direct: Rc<FakeHttpTransport>) -> FetchChannel {
        let front = Rc::new(FakeHttpTransport::new());
        FetchChannel::new(
            "https://lox.example",
            "https://front.example",
            direct,
            Box::new(move || front.clone() as Rc<dyn crate::fetch::HttpTransport>),
        )
    }

    #[test]
    fn test_openreq_success_passes_through_raw_text() {
        futures::executor::block_on(async {
            let direct = Rc::new(FakeHttpTransport::new());
            direct.script("openreq", Ok(json!({"cred": "abc"}).to_string()));
            let client = LoxAuthorityClient::new(channel_with(direct));
            let resp = client.openreq(true, "{}").await.unwrap();
            assert_eq!(resp, json!({"cred": "abc"}).to_string());
        });
    }

    #[test]
    fn test_openreq_error_envelope_becomes_procedure_error() {
        futures::executor::block_on(async {
            let direct = Rc::new(FakeHttpTransport::new());
            direct.script("openreq", Ok(json!({"error": "invite already used"}).to_string()));
            let client = LoxAuthorityClient::new(channel_with(direct));
            let err = client.openreq(true, "{}").await.unwrap_err();
            assert!(matches!(err, AppError::ProcedureError(ref m) if m == "invite already used"));
        });
    }

    #[test]
    fn test_pubkeys_opaque_passthrough() {
        futures::executor::block_on(async {
            let direct = Rc::new(FakeHttpTransport::new());
            direct.script("pubkeys", Ok("not-json-but-opaque".to_string()));
            let client = LoxAuthorityClient::new(channel_with(direct));
            let resp = client.pubkeys(true).await.unwrap();
            assert_eq!(resp, "not-json-but-opaque");
        });
    }
}
