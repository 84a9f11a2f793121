//! Hands matching requests to the edge function isolate.

use crate::edge_functions::registry::EdgeFunctionsRegistry;
use crate::geo::GeoContext;
use crate::http::{headers, DevRequest};
use crate::runtime::{BlobsContext, DevConfig, SiteInfo};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const LOCAL_HOST: &str = "127.0.0.1";

fn encode_json<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(BASE64.encode(bytes)),
        Err(err) => {
            warn!("Could not encode edge function header: {}", err);
            None
        }
    }
}

/// Settings the proxy stamps onto isolate requests.
#[derive(Debug, Clone, Default)]
pub struct EdgeProxySettings {
    pub site: SiteInfo,
    pub account_id: Option<String>,
    pub blobs: Option<BlobsContext>,
    pub feature_flags: BTreeMap<String, bool>,
    /// Port of the isolate.
    pub isolate_port: u16,
    /// Port of the primary listener.
    pub main_port: u16,
    /// Plain HTTP port the isolate passes requests back to.
    pub passthrough_port: u16,
    /// Scheme of the primary listener.
    pub scheme: &'static str,
    pub debug: bool,
}

impl EdgeProxySettings {
    pub fn from_config(config: &DevConfig) -> Self {
        Self {
            site: config.site.clone(),
            account_id: config.account_id.clone(),
            blobs: config.blobs.clone(),
            feature_flags: config.edge_functions.feature_flags.clone(),
            isolate_port: config.edge_functions.isolate_port,
            main_port: config.port,
            passthrough_port: config.secondary_port.unwrap_or(config.port),
            scheme: config.scheme(),
            debug: config.debug,
        }
    }
}

/// Decides whether a request goes to the isolate and prepares its headers.
pub struct EdgeFunctionsProxy {
    registry: Arc<EdgeFunctionsRegistry>,
    settings: EdgeProxySettings,
    geo: Arc<GeoContext>,
}

impl EdgeFunctionsProxy {
    pub fn new(
        registry: Arc<EdgeFunctionsRegistry>,
        settings: EdgeProxySettings,
        geo: Arc<GeoContext>,
    ) -> Self {
        Self {
            registry,
            settings,
            geo,
        }
    }

    pub fn registry(&self) -> &Arc<EdgeFunctionsRegistry> {
        &self.registry
    }

    fn site_header(&self) -> serde_json::Value {
        let local_url = format!("{}://localhost:{}", self.settings.scheme, self.settings.main_port);
        json!({
            "id": self.settings.site.id,
            "name": self.settings.site.name,
            "url": local_url,
        })
    }

    /// Stamp identity headers on `req` and, if an edge function matches,
    /// the routing headers as well.
    ///
    /// Returns the isolate origin to forward to, or `None` when the request
    /// continues through the rest of the pipeline.
    pub async fn handle(&self, req: &mut DevRequest) -> Option<String> {
        if req.get_header(headers::PASSTHROUGH).is_some() {
            return None;
        }

        if let Some(geo) = encode_json(self.geo.location().await) {
            req.set_header(headers::GEO, &geo);
        }
        req.set_header(headers::DEPLOY_ID, "0");
        req.set_header(headers::DEPLOY_CONTEXT, "dev");
        if let Some(site) = encode_json(&self.site_header()) {
            req.set_header(headers::SITE_INFO, &site);
        }
        if let Some(account) = encode_json(&json!({ "id": self.settings.account_id })) {
            req.set_header(headers::ACCOUNT_INFO, &account);
        }
        if let Some(blobs) = self.settings.blobs.as_ref().and_then(encode_json) {
            req.set_header(headers::BLOBS_INFO, &blobs);
        }

        if let Err(err) = self.registry.initialize().await {
            debug!("Edge functions unavailable after failed build: {}", err);
        }

        let path = req.path.clone();
        let matched = self
            .registry
            .match_url_path(&path, &req.method, &req.headers)
            .await?;

        if let Some(flags) = encode_json(&self.settings.feature_flags) {
            req.set_header(headers::FEATURE_FLAGS, &flags);
        }
        req.set_header(headers::FORWARDED_PROTO, &format!("{}:", self.settings.scheme));
        req.set_header(headers::EDGE_FUNCTIONS, &matched.function_names.join(","));
        if let Some(metadata) = encode_json(&matched.metadata) {
            req.set_header(headers::EDGE_FUNCTIONS_METADATA, &metadata);
        }
        req.set_header(headers::CLIENT_CONNECTION_IP, LOCAL_HOST);
        req.set_header(headers::PASSTHROUGH, "passthrough");
        req.set_header(
            headers::PASSTHROUGH_HOST,
            &format!("localhost:{}", self.settings.passthrough_port),
        );
        req.set_header(headers::PASSTHROUGH_PROTO, "http:");
        if self.settings.debug {
            req.set_header(headers::DEBUG_LOGGING, "1");
        }

        debug!(
            "Routing {} to edge functions {}",
            path,
            matched.function_names.join(", ")
        );
        Some(format!("http://{}:{}", LOCAL_HOST, self.settings.isolate_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge_functions::bundler::{BuildOutput, BundlerError, EdgeBundler, EdgeFunction};
    use crate::edge_functions::registry::EdgeRegistrySettings;
    use crate::edge_functions::Declaration;
    use crate::geo::{GeoError, GeoLookup, GeoResolver, Geolocation};
    use async_trait::async_trait;
    use hyper::Method;
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct OneFunction;

    #[async_trait]
    impl EdgeBundler for OneFunction {
        async fn find(&self, directories: &[PathBuf]) -> Result<Vec<EdgeFunction>, BundlerError> {
            Ok(directories
                .iter()
                .map(|dir| EdgeFunction::new("hello", dir.join("hello.ts")))
                .collect())
        }

        async fn build(
            &self,
            _functions: &[EdgeFunction],
            _env: &HashMap<String, String>,
        ) -> Result<BuildOutput, BundlerError> {
            Ok(BuildOutput {
                success: true,
                ..Default::default()
            })
        }
    }

    struct NoLookup;

    #[async_trait]
    impl GeoLookup for NoLookup {
        async fn lookup(&self) -> Result<Geolocation, GeoError> {
            Err(GeoError::Lookup("offline".to_string()))
        }
    }

    fn proxy(dir: &std::path::Path) -> EdgeFunctionsProxy {
        let registry = EdgeFunctionsRegistry::new(
            Arc::new(OneFunction),
            EdgeRegistrySettings {
                directories: vec![PathBuf::from("/site/edge")],
                declarations: vec![Declaration::new("hello", "/hello")],
                ..Default::default()
            },
        );
        let mut config = DevConfig::new().project_dir(dir).port(8888);
        config.geo.country = Some("DE".to_string());
        config.secondary_port = Some(9999);
        config.debug = true;
        let settings = EdgeProxySettings::from_config(&config);
        let geo = GeoContext::new(
            GeoResolver::new(dir, Box::new(NoLookup)),
            &config.geo,
            config.offline,
        );
        EdgeFunctionsProxy::new(registry, settings, Arc::new(geo))
    }

    fn decode(req: &DevRequest, name: &str) -> serde_json::Value {
        let raw = BASE64.decode(req.get_header(name).unwrap()).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_matching_request_gets_isolate_headers() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy(dir.path());
        let mut req = DevRequest::new(Method::GET, "/hello");

        let target = proxy.handle(&mut req).await;
        assert_eq!(target.as_deref(), Some("http://127.0.0.1:8971"));
        assert_eq!(req.get_header(headers::EDGE_FUNCTIONS), Some("hello"));
        assert_eq!(req.get_header(headers::PASSTHROUGH_HOST), Some("localhost:9999"));
        assert_eq!(req.get_header(headers::FORWARDED_PROTO), Some("http:"));
        assert_eq!(req.get_header(headers::DEBUG_LOGGING), Some("1"));
        assert_eq!(decode(&req, headers::GEO)["country"]["code"], "DE");
        assert_eq!(decode(&req, headers::SITE_INFO)["url"], "http://localhost:8888");
        assert_eq!(decode(&req, headers::EDGE_FUNCTIONS_METADATA)["req_routes"], json!([0]));
    }

    #[tokio::test]
    async fn test_unmatched_and_passthrough_requests() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy(dir.path());

        let mut other = DevRequest::new(Method::GET, "/other");
        assert!(proxy.handle(&mut other).await.is_none());
        assert_eq!(other.get_header(headers::DEPLOY_CONTEXT), Some("dev"));
        assert!(other.get_header(headers::EDGE_FUNCTIONS).is_none());

        let mut passthrough =
            DevRequest::new(Method::GET, "/hello").header(headers::PASSTHROUGH, "passthrough");
        assert!(proxy.handle(&mut passthrough).await.is_none());
        assert!(passthrough.get_header(headers::GEO).is_none());
    }
}
