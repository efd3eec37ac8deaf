// user agent used for outgoing HTTP(s) requests to identity providers
pub const REQUEST_USER_AGENT: &str = "gafaelfawr/1";

// default bind address for the gateway's HTTP server
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

// session cookie name
pub const SESSION_COOKIE_NAME: &str = "gafaelfawr_session";
