use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use sentiment_kafka::OffsetReset;
use sentiment_kafka::consumer::KafkaConsumerConfig;
use tracing::info;

use crate::Error;
use crate::Result;
use crate::archiver::hbase;
use crate::writer::mysql;

const ENV_KAFKA_BOOTSTRAP_SERVERS: &str = "KAFKA_BOOTSTRAP_SERVERS";
const ENV_KAFKA_TOPIC: &str = "KAFKA_TOPIC";
const ENV_KAFKA_CONSUMER_GROUP_ID: &str = "KAFKA_CONSUMER_GROUP_ID";
const ENV_KAFKA_AUTO_OFFSET_RESET: &str = "KAFKA_AUTO_OFFSET_RESET";
const ENV_KAFKA_PRODUCER_TIMEOUT: &str = "KAFKA_PRODUCER_TIMEOUT";
const ENV_KAFKA_BATCH_SIZE: &str = "KAFKA_BATCH_SIZE";
const ENV_KAFKA_READ_TIMEOUT_MS: &str = "KAFKA_READ_TIMEOUT_MS";

const ENV_HBASE_HOST: &str = "HBASE_HOST";
const ENV_HBASE_PORT: &str = "HBASE_PORT";
const ENV_HBASE_TABLE_NAME: &str = "HBASE_TABLE_NAME";
const ENV_HBASE_COLUMN_FAMILY: &str = "HBASE_COLUMN_FAMILY";
const ENV_HBASE_MAX_RETRIES: &str = "HBASE_MAX_RETRIES";
const ENV_HBASE_RETRY_DELAY: &str = "HBASE_RETRY_DELAY";

const ENV_MYSQL_HOST: &str = "MYSQL_HOST";
const ENV_MYSQL_PORT: &str = "MYSQL_PORT";
const ENV_MYSQL_DATABASE: &str = "MYSQL_DATABASE";
const ENV_MYSQL_USER: &str = "MYSQL_USER";
const ENV_MYSQL_PASSWORD: &str = "MYSQL_PASSWORD";
const ENV_MYSQL_AUTH_PLUGIN: &str = "MYSQL_AUTH_PLUGIN";
const ENV_MYSQL_MAX_RETRIES: &str = "MYSQL_MAX_RETRIES";
const ENV_MYSQL_RETRY_DELAY: &str = "MYSQL_RETRY_DELAY";
const ENV_MYSQL_POOL_SIZE: &str = "MYSQL_POOL_SIZE";

const ENV_SENTIMENT_MODEL_NAME: &str = "SENTIMENT_MODEL_NAME";
const ENV_SENTIMENT_MAX_LENGTH: &str = "SENTIMENT_MAX_LENGTH";
const ENV_SENTIMENT_ENDPOINT: &str = "SENTIMENT_ENDPOINT";
const ENV_SENTIMENT_API_TOKEN: &str = "SENTIMENT_API_TOKEN";
const ENV_SENTIMENT_TIMEOUT_MS: &str = "SENTIMENT_TIMEOUT_MS";
const ENV_SENTIMENT_MAX_RETRIES: &str = "SENTIMENT_MAX_RETRIES";
const ENV_SENTIMENT_RETRY_DELAY: &str = "SENTIMENT_RETRY_DELAY";

const ENV_RETRY_BACKOFF: &str = "RETRY_BACKOFF";
const ENV_RETRY_MAX_DELAY: &str = "RETRY_MAX_DELAY";
const ENV_METRICS_PORT: &str = "METRICS_PORT";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const DEFAULT_METRICS_PORT: u16 = 2469;
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
/// librdkafka's default `max.poll.interval.ms`, kept as the floor.
const MIN_MAX_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// The largest `max.poll.interval.ms` librdkafka accepts.
const MAX_MAX_POLL_INTERVAL: Duration = Duration::from_secs(86_400);

/// Shape of the delays between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(Error::Config(format!(
                "Unknown retry backoff '{other}', expected 'fixed' or 'exponential'"
            ))),
        }
    }
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffKind::Fixed => write!(f, "fixed"),
            BackoffKind::Exponential => write!(f, "exponential"),
        }
    }
}

/// Retry policy for one downstream dependency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; `n` means at most `n + 1` calls.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: BackoffKind,
    /// Upper bound of a single delay, only reached with exponential backoff.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn fixed(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: BackoffKind::Fixed,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }

    /// Longest a retried call can take when every attempt runs into `call_timeout`.
    pub fn worst_case(&self, call_timeout: Duration) -> Duration {
        let calls = call_timeout.saturating_mul(self.max_retries.saturating_add(1));
        let sleeps = match self.backoff {
            BackoffKind::Fixed => self.base_delay.saturating_mul(self.max_retries),
            BackoffKind::Exponential => {
                let mut total = Duration::ZERO;
                let mut delay = self.base_delay;
                for spent in 0..self.max_retries {
                    if delay >= self.max_delay {
                        let left = self.max_retries - spent;
                        total = total.saturating_add(self.max_delay.saturating_mul(left));
                        break;
                    }
                    if delay.is_zero() {
                        break;
                    }
                    total = total.saturating_add(delay);
                    delay = delay.saturating_mul(2);
                }
                total
            }
        };
        calls.saturating_add(sleeps)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub bootstrap_servers: Vec<String>,
    pub topic: String,
    pub consumer_group_id: String,
    pub auto_offset_reset: OffsetReset,
    pub session_timeout: Duration,
    pub batch_size: usize,
    pub read_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_owned()],
            topic: "comments".to_owned(),
            consumer_group_id: "example-consumer-group".to_owned(),
            auto_offset_reset: OffsetReset::Earliest,
            session_timeout: Duration::from_secs(10),
            batch_size: 100,
            read_timeout: Duration::from_millis(1000),
        }
    }
}

impl KafkaConfig {
    pub fn consumer_config(&self, max_poll_interval: Duration) -> KafkaConsumerConfig {
        KafkaConsumerConfig {
            brokers: self.bootstrap_servers.clone(),
            topic: self.topic.clone(),
            consumer_group: self.consumer_group_id.clone(),
            offset_reset: self.auto_offset_reset,
            session_timeout: self.session_timeout,
            max_poll_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HBaseConfig {
    pub host: String,
    /// Port of the HBase REST gateway.
    pub port: u16,
    pub table_name: String,
    pub column_family: String,
    pub retry: RetryConfig,
}

impl Default for HBaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8080,
            table_name: "comments".to_owned(),
            column_family: "data".to_owned(),
            retry: RetryConfig::fixed(5, Duration::from_secs(5)),
        }
    }
}

impl HBaseConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Authentication plugin the MySQL user is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPlugin {
    #[default]
    MysqlNativePassword,
    CachingSha2Password,
}

impl FromStr for AuthPlugin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mysql_native_password" => Ok(AuthPlugin::MysqlNativePassword),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2Password),
            other => Err(Error::Config(format!(
                "Unknown MySQL auth plugin '{other}', expected 'mysql_native_password' or 'caching_sha2_password'"
            ))),
        }
    }
}

impl fmt::Display for AuthPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPlugin::MysqlNativePassword => write!(f, "mysql_native_password"),
            AuthPlugin::CachingSha2Password => write!(f, "caching_sha2_password"),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub auth_plugin: AuthPlugin,
    pub retry: RetryConfig,
    pub pool_size: u32,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 3306,
            database: "sentiment_analysis".to_owned(),
            user: "user".to_owned(),
            password: "password".to_owned(),
            auth_plugin: AuthPlugin::MysqlNativePassword,
            retry: RetryConfig::fixed(5, Duration::from_secs(5)),
            pool_size: 5,
        }
    }
}

impl fmt::Debug for MySqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"*****")
            .field("auth_plugin", &self.auth_plugin)
            .field("retry", &self.retry)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct SentimentConfig {
    pub model_name: String,
    /// Longest text, in characters, handed to the model.
    pub max_length: usize,
    pub endpoint: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            model_name: "tabularisai/multilingual-sentiment-analysis".to_owned(),
            max_length: 512,
            endpoint: "https://api-inference.huggingface.co/models".to_owned(),
            api_token: None,
            timeout: Duration::from_millis(10_000),
            retry: RetryConfig::fixed(3, Duration::from_secs(1)),
        }
    }
}

impl SentimentConfig {
    /// Inference URL of the configured model.
    pub fn model_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.model_name.trim_start_matches('/')
        )
    }
}

impl fmt::Debug for SentimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentimentConfig")
            .field("model_name", &self.model_name)
            .field("max_length", &self.max_length)
            .field("endpoint", &self.endpoint)
            .field("api_token", &self.api_token.as_ref().map(|_| "*****"))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Process configuration, read once at startup and passed down by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub kafka: KafkaConfig,
    pub hbase: HBaseConfig,
    pub mysql: MySqlConfig,
    pub sentiment: SentimentConfig,
    pub metrics_port: u16,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            hbase: HBaseConfig::default(),
            mysql: MySqlConfig::default(),
            sentiment: SentimentConfig::default(),
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "INFO".to_owned(),
        }
    }
}

impl Settings {
    /// How long one batch may take before the group gives our partitions away. Sized for every
    /// event of a batch landing on one partition and every stage timing out on every attempt.
    pub fn max_poll_interval(&self) -> Duration {
        let per_event = self
            .hbase
            .retry
            .worst_case(hbase::REQUEST_TIMEOUT)
            .saturating_add(self.sentiment.retry.worst_case(self.sentiment.timeout))
            .saturating_add(self.mysql.retry.worst_case(mysql::ACQUIRE_TIMEOUT));
        let batch_size = u32::try_from(self.kafka.batch_size).unwrap_or(u32::MAX);
        per_event
            .saturating_mul(batch_size)
            .max(MIN_MAX_POLL_INTERVAL)
            .max(self.kafka.session_timeout)
            .min(MAX_MAX_POLL_INTERVAL)
    }

    pub fn consumer_config(&self) -> KafkaConsumerConfig {
        self.kafka.consumer_config(self.max_poll_interval())
    }

    /// Builds the settings from the process environment.
    pub fn load() -> Result<Self> {
        let env_vars: HashMap<String, String> = env::vars().collect();
        env_vars.try_into()
    }

    /// Logs the effective configuration. Credentials are left out.
    pub fn log_summary(&self) {
        info!(
            brokers = %self.kafka.bootstrap_servers.join(","),
            topic = %self.kafka.topic,
            group = %self.kafka.consumer_group_id,
            offset_reset = %self.kafka.auto_offset_reset,
            batch_size = self.kafka.batch_size,
            read_timeout_ms = self.kafka.read_timeout.as_millis() as u64,
            max_poll_interval_ms = self.max_poll_interval().as_millis() as u64,
            "Kafka configuration"
        );
        info!(
            url = %self.hbase.base_url(),
            table = %self.hbase.table_name,
            column_family = %self.hbase.column_family,
            max_retries = self.hbase.retry.max_retries,
            retry_delay_ms = self.hbase.retry.base_delay.as_millis() as u64,
            "HBase configuration"
        );
        info!(
            host = %self.mysql.host,
            port = self.mysql.port,
            database = %self.mysql.database,
            user = %self.mysql.user,
            auth_plugin = %self.mysql.auth_plugin,
            pool_size = self.mysql.pool_size,
            max_retries = self.mysql.retry.max_retries,
            retry_delay_ms = self.mysql.retry.base_delay.as_millis() as u64,
            "MySQL configuration"
        );
        info!(
            model = %self.sentiment.model_name,
            endpoint = %self.sentiment.endpoint,
            max_length = self.sentiment.max_length,
            token_set = self.sentiment.api_token.is_some(),
            backoff = %self.sentiment.retry.backoff,
            "Sentiment model configuration"
        );
    }
}

fn parse_var<T>(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = env_vars.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("Parsing {key}(set to '{raw}'): {e}")))
}

/// Delays are configured in seconds and may be fractional.
fn parse_secs(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<Duration>> {
    let Some(secs) = parse_var::<f64>(env_vars, key)? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| Error::Config(format!("Parsing {key}(set to '{secs}'): {e}")))
}

fn parse_millis(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(env_vars, key)?.map(Duration::from_millis))
}

fn non_empty(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<String>> {
    match env_vars.get(key).map(|v| v.trim()) {
        None => Ok(None),
        Some("") => Err(Error::Config(format!("{key} is set but empty"))),
        Some(v) => Ok(Some(v.to_owned())),
    }
}

/// This implementation is to load settings from env variables
impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> std::result::Result<Self, Self::Error> {
        let mut settings = Settings::default();

        // kafka
        let kafka = &mut settings.kafka;
        if let Some(servers) = non_empty(&env_vars, ENV_KAFKA_BOOTSTRAP_SERVERS)? {
            kafka.bootstrap_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(topic) = non_empty(&env_vars, ENV_KAFKA_TOPIC)? {
            kafka.topic = topic;
        }
        if let Some(group) = non_empty(&env_vars, ENV_KAFKA_CONSUMER_GROUP_ID)? {
            kafka.consumer_group_id = group;
        }
        if let Some(reset) = parse_var::<OffsetReset>(&env_vars, ENV_KAFKA_AUTO_OFFSET_RESET)? {
            kafka.auto_offset_reset = reset;
        }
        if let Some(timeout) = parse_secs(&env_vars, ENV_KAFKA_PRODUCER_TIMEOUT)? {
            kafka.session_timeout = timeout;
        }
        if let Some(batch_size) = parse_var::<usize>(&env_vars, ENV_KAFKA_BATCH_SIZE)? {
            kafka.batch_size = batch_size;
        }
        if let Some(read_timeout) = parse_millis(&env_vars, ENV_KAFKA_READ_TIMEOUT_MS)? {
            kafka.read_timeout = read_timeout;
        }

        // hbase
        let hbase = &mut settings.hbase;
        if let Some(host) = non_empty(&env_vars, ENV_HBASE_HOST)? {
            hbase.host = host;
        }
        if let Some(port) = parse_var::<u16>(&env_vars, ENV_HBASE_PORT)? {
            hbase.port = port;
        }
        if let Some(table) = non_empty(&env_vars, ENV_HBASE_TABLE_NAME)? {
            hbase.table_name = table;
        }
        if let Some(family) = non_empty(&env_vars, ENV_HBASE_COLUMN_FAMILY)? {
            hbase.column_family = family;
        }
        if let Some(retries) = parse_var::<u32>(&env_vars, ENV_HBASE_MAX_RETRIES)? {
            hbase.retry.max_retries = retries;
        }
        if let Some(delay) = parse_secs(&env_vars, ENV_HBASE_RETRY_DELAY)? {
            hbase.retry.base_delay = delay;
        }

        // mysql
        let mysql = &mut settings.mysql;
        if let Some(host) = non_empty(&env_vars, ENV_MYSQL_HOST)? {
            mysql.host = host;
        }
        if let Some(port) = parse_var::<u16>(&env_vars, ENV_MYSQL_PORT)? {
            mysql.port = port;
        }
        if let Some(database) = non_empty(&env_vars, ENV_MYSQL_DATABASE)? {
            mysql.database = database;
        }
        if let Some(user) = non_empty(&env_vars, ENV_MYSQL_USER)? {
            mysql.user = user;
        }
        // an empty password is legitimate
        if let Some(password) = env_vars.get(ENV_MYSQL_PASSWORD) {
            mysql.password = password.to_owned();
        }
        if let Some(plugin) = parse_var::<AuthPlugin>(&env_vars, ENV_MYSQL_AUTH_PLUGIN)? {
            mysql.auth_plugin = plugin;
        }
        if let Some(retries) = parse_var::<u32>(&env_vars, ENV_MYSQL_MAX_RETRIES)? {
            mysql.retry.max_retries = retries;
        }
        if let Some(delay) = parse_secs(&env_vars, ENV_MYSQL_RETRY_DELAY)? {
            mysql.retry.base_delay = delay;
        }
        if let Some(pool_size) = parse_var::<u32>(&env_vars, ENV_MYSQL_POOL_SIZE)? {
            mysql.pool_size = pool_size;
        }

        // sentiment model
        let sentiment = &mut settings.sentiment;
        if let Some(model) = non_empty(&env_vars, ENV_SENTIMENT_MODEL_NAME)? {
            sentiment.model_name = model;
        }
        if let Some(max_length) = parse_var::<usize>(&env_vars, ENV_SENTIMENT_MAX_LENGTH)? {
            sentiment.max_length = max_length;
        }
        if let Some(endpoint) = non_empty(&env_vars, ENV_SENTIMENT_ENDPOINT)? {
            sentiment.endpoint = endpoint;
        }
        sentiment.api_token = env_vars
            .get(ENV_SENTIMENT_API_TOKEN)
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
        if let Some(timeout) = parse_millis(&env_vars, ENV_SENTIMENT_TIMEOUT_MS)? {
            sentiment.timeout = timeout;
        }
        if let Some(retries) = parse_var::<u32>(&env_vars, ENV_SENTIMENT_MAX_RETRIES)? {
            sentiment.retry.max_retries = retries;
        }
        if let Some(delay) = parse_secs(&env_vars, ENV_SENTIMENT_RETRY_DELAY)? {
            sentiment.retry.base_delay = delay;
        }

        // shared retry shape
        let backoff = parse_var::<BackoffKind>(&env_vars, ENV_RETRY_BACKOFF)?.unwrap_or_default();
        let max_delay =
            parse_secs(&env_vars, ENV_RETRY_MAX_DELAY)?.unwrap_or(DEFAULT_RETRY_MAX_DELAY);
        for retry in [
            &mut settings.hbase.retry,
            &mut settings.mysql.retry,
            &mut settings.sentiment.retry,
        ] {
            retry.backoff = backoff;
            retry.max_delay = max_delay;
        }

        if let Some(port) = parse_var::<u16>(&env_vars, ENV_METRICS_PORT)? {
            settings.metrics_port = port;
        }
        if let Some(level) = non_empty(&env_vars, ENV_LOG_LEVEL)? {
            settings.log_level = level;
        }

        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_BOOTSTRAP_SERVERS} does not name any broker"
            )));
        }
        if self.kafka.batch_size == 0 {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_BATCH_SIZE} must be greater than 0"
            )));
        }
        if self.sentiment.max_length == 0 {
            return Err(Error::Config(format!(
                "{ENV_SENTIMENT_MAX_LENGTH} must be greater than 0"
            )));
        }
        if self.mysql.pool_size == 0 {
            return Err(Error::Config(format!(
                "{ENV_MYSQL_POOL_SIZE} must be greater than 0"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = Settings::try_from(HashMap::new()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.kafka.bootstrap_servers, vec!["localhost:9092"]);
        assert_eq!(settings.kafka.consumer_group_id, "example-consumer-group");
        assert_eq!(settings.hbase.base_url(), "http://localhost:8080");
        assert_eq!(settings.hbase.retry.max_retries, 5);
        assert_eq!(settings.mysql.database, "sentiment_analysis");
        assert_eq!(settings.sentiment.retry.max_retries, 3);
        assert_eq!(settings.sentiment.retry.base_delay, Duration::from_secs(1));
        assert_eq!(
            settings.sentiment.model_url(),
            "https://api-inference.huggingface.co/models/tabularisai/multilingual-sentiment-analysis"
        );
        assert_eq!(settings.metrics_port, 2469);
    }

    #[test]
    fn overrides_from_env() {
        let settings = Settings::try_from(vars(&[
            (ENV_KAFKA_BOOTSTRAP_SERVERS, "kafka-0:9092, kafka-1:9092"),
            (ENV_KAFKA_TOPIC, "chat"),
            (ENV_KAFKA_AUTO_OFFSET_RESET, "latest"),
            (ENV_KAFKA_PRODUCER_TIMEOUT, "30"),
            (ENV_KAFKA_BATCH_SIZE, "10"),
            (ENV_HBASE_PORT, "8085"),
            (ENV_HBASE_RETRY_DELAY, "0.5"),
            (ENV_MYSQL_AUTH_PLUGIN, "caching_sha2_password"),
            (ENV_MYSQL_PASSWORD, ""),
            (ENV_SENTIMENT_API_TOKEN, "hf_secret"),
            (ENV_SENTIMENT_MAX_LENGTH, "64"),
            (ENV_RETRY_BACKOFF, "Exponential"),
            (ENV_METRICS_PORT, "9090"),
        ]))
        .unwrap();

        assert_eq!(
            settings.kafka.bootstrap_servers,
            vec!["kafka-0:9092", "kafka-1:9092"]
        );
        assert_eq!(settings.kafka.topic, "chat");
        assert_eq!(settings.kafka.auto_offset_reset, OffsetReset::Latest);
        assert_eq!(settings.kafka.session_timeout, Duration::from_secs(30));
        assert_eq!(settings.kafka.batch_size, 10);
        assert_eq!(settings.hbase.port, 8085);
        assert_eq!(settings.hbase.retry.base_delay, Duration::from_millis(500));
        assert_eq!(settings.mysql.auth_plugin, AuthPlugin::CachingSha2Password);
        assert_eq!(settings.mysql.password, "");
        assert_eq!(settings.sentiment.api_token.as_deref(), Some("hf_secret"));
        assert_eq!(settings.sentiment.max_length, 64);
        assert_eq!(settings.hbase.retry.backoff, BackoffKind::Exponential);
        assert_eq!(settings.mysql.retry.backoff, BackoffKind::Exponential);
        assert_eq!(settings.sentiment.retry.backoff, BackoffKind::Exponential);
        assert_eq!(settings.metrics_port, 9090);

        let consumer = settings.consumer_config();
        assert_eq!(consumer.topic, "chat");
        assert_eq!(consumer.offset_reset, OffsetReset::Latest);
    }

    #[test]
    fn retry_worst_case_counts_calls_and_sleeps() {
        let timeout = Duration::from_secs(10);
        // six calls and five 5s sleeps
        assert_eq!(
            RetryConfig::fixed(5, Duration::from_secs(5)).worst_case(timeout),
            Duration::from_secs(85)
        );
        assert_eq!(
            RetryConfig::fixed(0, Duration::from_secs(5)).worst_case(timeout),
            timeout
        );

        let exponential = RetryConfig {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            backoff: BackoffKind::Exponential,
            max_delay: Duration::from_secs(3),
        };
        // 1s + 2s + 3s + 3s
        assert_eq!(
            exponential.worst_case(Duration::ZERO),
            Duration::from_secs(9)
        );
    }

    #[test]
    fn poll_interval_covers_a_batch_of_worst_case_events() {
        let settings = Settings::default();
        // hbase 85s, model 4 x 10s + 3s, mysql 85s, for each of the 100 events
        assert_eq!(settings.max_poll_interval(), Duration::from_secs(21_300));
        assert_eq!(
            settings.consumer_config().max_poll_interval,
            Duration::from_secs(21_300)
        );

        let small = Settings::try_from(vars(&[
            (ENV_KAFKA_BATCH_SIZE, "1"),
            (ENV_HBASE_MAX_RETRIES, "0"),
            (ENV_MYSQL_MAX_RETRIES, "0"),
            (ENV_SENTIMENT_MAX_RETRIES, "0"),
        ]))
        .unwrap();
        assert_eq!(small.max_poll_interval(), Duration::from_secs(300));

        let huge = Settings::try_from(vars(&[(ENV_KAFKA_BATCH_SIZE, "100000")])).unwrap();
        assert_eq!(huge.max_poll_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for (key, value) in [
            (ENV_HBASE_PORT, "eighty"),
            (ENV_KAFKA_AUTO_OFFSET_RESET, "sometimes"),
            (ENV_MYSQL_AUTH_PLUGIN, "sha256_password"),
            (ENV_RETRY_BACKOFF, "linear"),
            (ENV_MYSQL_RETRY_DELAY, "-1"),
            (ENV_KAFKA_BATCH_SIZE, "0"),
            (ENV_KAFKA_TOPIC, "  "),
        ] {
            let result = Settings::try_from(vars(&[(key, value)]));
            assert!(
                matches!(result, Err(Error::Config(_))),
                "{key}={value} should be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn secrets_are_not_printed() {
        let settings = Settings::try_from(vars(&[
            (ENV_MYSQL_PASSWORD, "hunter2"),
            (ENV_SENTIMENT_API_TOKEN, "hf_secret"),
        ]))
        .unwrap();
        let printed = format!("{settings:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("hf_secret"));
    }
}
