//! The request router and the CDN behaviour it emulates.

mod error_page;
mod etag;
mod header_rules;
mod jwt;
mod redirect;
mod rewriter;
mod router;
mod sign;
mod static_files;
mod upstream;

pub use error_page::{format_edge_error, render_404, render_error_template, EdgeErrorFormatError};
pub(crate) use error_page::escape_html;
pub use etag::{weak_etag, EtagPolicy};
pub use header_rules::{HeaderRule, HeaderRules};
pub use jwt::{check_roles, decode_claims, RoleCheck, JWT_COOKIE, NOT_FOUND_PATH};
pub use rewriter::{Match, NoRules, Rewriter, RuleRequest};
pub use router::{Router, RouterSettings};
pub use sign::sign_redirect;
pub use static_files::{alternative_paths_for, get_static, StaticFiles};
pub use upstream::{fetch_bytes, ProxyError, Upstream};
