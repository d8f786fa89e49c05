//! Application classification. Only postgres and mysql change the backup
//! branch; the other tags ride along as metadata and drive the legacy
//! data-path hints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Postgres,
    Mysql,
    Redis,
    Mongo,
    Rabbitmq,
    Elasticsearch,
    Nginx,
    Wordpress,
    Nextcloud,
    Ghost,
    Gitea,
    Grafana,
    Minio,
    Generic,
}

/// Ordered: first hit wins, so postgres/timescale outranks the generic
/// tail and `mysql` matches before shorter substrings could.
const PATTERNS: &[(&str, AppType)] = &[
    ("timescale", AppType::Postgres),
    ("postgres", AppType::Postgres),
    ("mariadb", AppType::Mysql),
    ("mysql", AppType::Mysql),
    ("redis", AppType::Redis),
    ("mongodb", AppType::Mongo),
    ("mongo", AppType::Mongo),
    ("rabbitmq", AppType::Rabbitmq),
    ("elasticsearch", AppType::Elasticsearch),
    ("nextcloud", AppType::Nextcloud),
    ("wordpress", AppType::Wordpress),
    ("ghost", AppType::Ghost),
    ("gitea", AppType::Gitea),
    ("grafana", AppType::Grafana),
    ("minio", AppType::Minio),
    ("nginx", AppType::Nginx),
];

impl AppType {
    /// Labels outrank the image reference: the compose service name and
    /// the image title tend to survive retagging.
    pub fn detect(image: &str, labels: &HashMap<String, String>) -> AppType {
        let candidates = [
            labels.get("com.docker.compose.service").cloned(),
            labels.get("org.opencontainers.image.title").cloned(),
            Some(image.to_string()),
        ];
        for candidate in candidates.into_iter().flatten() {
            let lowered = candidate.to_lowercase();
            for (pattern, app) in PATTERNS {
                if lowered.contains(pattern) {
                    return *app;
                }
            }
        }
        AppType::Generic
    }

    /// True for services that get started ahead of the application cohort
    /// during a stack restore.
    pub fn is_database(self) -> bool {
        matches!(
            self,
            AppType::Postgres | AppType::Mysql | AppType::Redis | AppType::Mongo
        )
    }

    /// Whether backup takes the logical-dump branch.
    pub fn has_dump_strategy(self) -> bool {
        matches!(self, AppType::Postgres | AppType::Mysql)
    }

    /// Well-known data directories, used only by the legacy
    /// single-container fallback when nothing declares a volume.
    pub fn default_data_paths(self) -> &'static [&'static str] {
        match self {
            AppType::Redis => &["/data"],
            AppType::Mongo => &["/data/db"],
            AppType::Rabbitmq => &["/var/lib/rabbitmq"],
            AppType::Elasticsearch => &["/usr/share/elasticsearch/data"],
            AppType::Nginx => &["/usr/share/nginx/html"],
            AppType::Wordpress | AppType::Nextcloud => &["/var/www/html"],
            AppType::Ghost => &["/var/lib/ghost/content"],
            AppType::Gitea => &["/data"],
            AppType::Grafana => &["/var/lib/grafana"],
            AppType::Minio => &["/data"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppType::Postgres => "postgres",
            AppType::Mysql => "mysql",
            AppType::Redis => "redis",
            AppType::Mongo => "mongo",
            AppType::Rabbitmq => "rabbitmq",
            AppType::Elasticsearch => "elasticsearch",
            AppType::Nginx => "nginx",
            AppType::Wordpress => "wordpress",
            AppType::Nextcloud => "nextcloud",
            AppType::Ghost => "ghost",
            AppType::Gitea => "gitea",
            AppType::Grafana => "grafana",
            AppType::Minio => "minio",
            AppType::Generic => "generic",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_image_substring_match() {
        assert_eq!(
            AppType::detect("postgres:16-alpine", &HashMap::new()),
            AppType::Postgres
        );
        assert_eq!(
            AppType::detect("timescale/timescaledb:latest", &HashMap::new()),
            AppType::Postgres
        );
        assert_eq!(
            AppType::detect("mariadb:11", &HashMap::new()),
            AppType::Mysql
        );
        assert_eq!(
            AppType::detect("some/custom-thing:1", &HashMap::new()),
            AppType::Generic
        );
    }

    #[test]
    fn test_labels_outrank_image() {
        let l = labels(&[("com.docker.compose.service", "postgres-main")]);
        assert_eq!(AppType::detect("internal/db-image:1", &l), AppType::Postgres);
    }

    #[test]
    fn test_only_dump_types_branch() {
        assert!(AppType::Postgres.has_dump_strategy());
        assert!(AppType::Mysql.has_dump_strategy());
        assert!(!AppType::Redis.has_dump_strategy());
        assert!(!AppType::Mongo.has_dump_strategy());
        assert!(!AppType::Generic.has_dump_strategy());
    }
}
