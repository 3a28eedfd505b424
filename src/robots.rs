use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use texting_robots::Robot;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
enum Rules {
    AllowAll,
    DenyAll,
    Parsed(Arc<Robot>),
}

impl Rules {
    fn allows(&self, url: &str) -> bool {
        match self {
            Rules::AllowAll => true,
            Rules::DenyAll => false,
            Rules::Parsed(robot) => robot.allowed(url),
        }
    }
}

/// robots.txt rules keyed by origin, fetched at most once per origin.
/// Unreachable or missing robots.txt means allow-all; 401, 403 and server
/// errors mean deny-all.
pub struct RobotsCache {
    agent: String,
    rules: Mutex<HashMap<String, Rules>>,
}

impl RobotsCache {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            rules: Mutex::new(HashMap::new()),
        }
    }

    pub fn allowed(&self, client: &Client, url: &str) -> bool {
        let Some(origin) = origin_of(url) else {
            return true;
        };

        let cached = self
            .rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&origin)
            .cloned();

        let rules = match cached {
            Some(rules) => rules,
            None => {
                let fetched = self.fetch_rules(client, &origin);
                self.rules
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .entry(origin)
                    .or_insert(fetched)
                    .clone()
            }
        };

        rules.allows(url)
    }

    fn fetch_rules(&self, client: &Client, origin: &str) -> Rules {
        let robots_url = format!("{origin}/robots.txt");
        let response = match client.get(&robots_url).send() {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => return rules_for_status(&robots_url, resp.status()),
            Err(err) => {
                debug!(url = %robots_url, error = %err, "could not fetch robots.txt; assuming allowed");
                return Rules::AllowAll;
            }
        };

        let body = match response.bytes() {
            Ok(body) => body,
            Err(err) => {
                warn!(url = %robots_url, error = %err, "failed to read robots.txt body");
                return Rules::AllowAll;
            }
        };
        parse_rules(&self.agent, &body).map_or(Rules::AllowAll, |robot| Rules::Parsed(Arc::new(robot)))
    }
}

fn rules_for_status(robots_url: &str, status: StatusCode) -> Rules {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) || status.is_server_error()
    {
        warn!(url = %robots_url, %status, "robots.txt refused; treating origin as disallowed");
        Rules::DenyAll
    } else {
        debug!(url = %robots_url, %status, "no robots.txt; assuming allowed");
        Rules::AllowAll
    }
}

fn parse_rules(agent: &str, body: &[u8]) -> Option<Robot> {
    match Robot::new(agent, body) {
        Ok(robot) => Some(robot),
        Err(err) => {
            warn!(agent, error = %err, "unparsable robots.txt; assuming allowed");
            None
        }
    }
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    Some(parsed.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = "User-agent: DataScraper\nDisallow: /private\n\nUser-agent: *\nDisallow: /\n";

    #[test]
    fn rules_apply_to_matching_agent() {
        let robot = parse_rules("DataScraper", RULES.as_bytes()).unwrap();
        assert!(robot.allowed("https://shop.example/catalogue"));
        assert!(!robot.allowed("https://shop.example/private/orders"));

        let other = parse_rules("SomeoneElse", RULES.as_bytes()).unwrap();
        assert!(!other.allowed("https://shop.example/catalogue"));
    }

    #[test]
    fn refusing_statuses_deny_everything() {
        let url = "https://shop.example/robots.txt";
        assert!(!rules_for_status(url, StatusCode::FORBIDDEN).allows("https://shop.example/a"));
        assert!(!rules_for_status(url, StatusCode::UNAUTHORIZED).allows("https://shop.example/a"));
        assert!(!rules_for_status(url, StatusCode::SERVICE_UNAVAILABLE).allows("https://shop.example/a"));
        assert!(rules_for_status(url, StatusCode::NOT_FOUND).allows("https://shop.example/a"));
        assert!(rules_for_status(url, StatusCode::GONE).allows("https://shop.example/a"));
    }

    #[test]
    fn origin_keeps_non_default_port() {
        assert_eq!(
            origin_of("http://127.0.0.1:8080/a/b?c=d").as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(
            origin_of("https://shop.example/x").as_deref(),
            Some("https://shop.example")
        );
        assert_eq!(origin_of("file:///tmp/page.html"), None);
    }
}
