//! Configuração do WorkHero carregada a partir de `workhero.toml`.
//!
//! A struct [`WorkheroConfig`] agrupa as seções do servidor, do store, do
//! oráculo de preço, do ledger, do worker e do envio de e-mail. Valores não
//! presentes no arquivo usam defaults sensíveis, de modo que um arquivo
//! ausente resulta em uma configuração de desenvolvimento executável.
//! Variáveis de ambiente têm precedência sobre o arquivo para segredos e
//! parâmetros de implantação.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Arquivo procurado no diretório atual quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "workhero.toml";

/// Configuração de nível superior.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkheroConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub price: PriceConfig,
    pub ledger: LedgerConfig,
    pub worker: WorkerConfig,
    pub mail: MailConfig,
}

/// Seção `[server]`: API HTTP e regras de precificação.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Endereço de escuta do servidor HTTP.
    pub bind: String,
    /// Preço por minuto em moeda fiduciária.
    pub rate_per_minute: f64,
    pub min_minutes: u32,
    pub max_minutes: u32,
    /// Token bearer exigido pelos endpoints do worker. Vazio rejeita tudo.
    pub worker_api_key: String,
    /// Habilita `POST /api/test/mark-paid/:id`.
    pub allow_test_payments: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            rate_per_minute: 0.10,
            min_minutes: 1,
            max_minutes: 120,
            worker_api_key: String::new(),
            allow_test_payments: false,
        }
    }
}

/// Qual implementação de banco usar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Local,
    Remote,
}

/// Seção `[store]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    /// Arquivo SQLite usado pelo backend local.
    pub path: PathBuf,
    /// URL do banco remoto (`libsql://` ou `https://`).
    pub url: String,
    pub auth_token: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Local,
            path: PathBuf::from("data/workhero.db"),
            url: String::new(),
            auth_token: String::new(),
        }
    }
}

/// Seção `[price]`: cotação fiat → cripto.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    pub feed_url: String,
    /// JSON pointer (RFC 6901) do campo numérico na resposta do feed.
    pub json_pointer: String,
    pub ttl_secs: u64,
    /// Cotação usada quando o feed nunca respondeu com sucesso.
    pub fallback_rate: f64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd"
                .to_string(),
            json_pointer: "/solana/usd".to_string(),
            ttl_secs: 60,
            fallback_rate: 190.0,
        }
    }
}

/// Seção `[ledger]`: RPC da Solana e parâmetros de correspondência.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Carteira que recebe os pagamentos.
    pub payment_address: String,
    /// Quantas transações recentes examinar por verificação.
    pub scan_limit: usize,
    /// Tolerância relativa aceita entre o valor esperado e o recebido.
    pub tolerance: f64,
    /// Deslocamento por item, em SOL por unidade de id.
    pub offset_scale: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            payment_address: String::new(),
            scan_limit: 20,
            tolerance: 0.005,
            offset_scale: 1e-9,
        }
    }
}

/// De onde o worker obtém itens pagos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Via API HTTP do broker, com token bearer.
    Remote,
    /// Direto no store configurado.
    Local,
}

/// Seção `[worker]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub mode: WorkerMode,
    pub api_base_url: String,
    pub api_key: String,
    pub poll_interval_secs: u64,
    pub error_backoff_secs: u64,
    /// Diretório base onde cada tarefa ganha um subdiretório próprio.
    pub tasks_dir: PathBuf,
    /// Executável do agente.
    pub program: String,
    /// Argumentos; `{prompt}` e `{tools}` são substituídos na execução.
    pub args: Vec<String>,
    pub allowed_tools: Vec<String>,
    /// Segundos entre SIGTERM e SIGKILL quando o prazo expira.
    pub grace_period_secs: u64,
    /// Tentativas de reportar o resultado ao broker antes de desistir.
    pub report_attempts: u32,
    /// Espera antes da segunda tentativa; dobra a cada nova falha.
    pub report_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::Remote,
            api_base_url: "http://localhost:3000".to_string(),
            api_key: String::new(),
            poll_interval_secs: 5,
            error_backoff_secs: 10,
            tasks_dir: PathBuf::from("tasks"),
            program: "claude".to_string(),
            args: [
                "-p",
                "{prompt}",
                "--output-format",
                "stream-json",
                "--verbose",
                "--no-session-persistence",
                "--allowedTools",
                "{tools}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_tools: [
                "WebSearch", "WebFetch", "Read", "Write", "Edit", "Bash", "Glob", "Grep",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            grace_period_secs: 10,
            report_attempts: 4,
            report_backoff_ms: 1_000,
        }
    }
}

/// Seção `[mail]`: relay SMTP de saída.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Usuário SMTP; vazio usa `from_address`.
    pub smtp_user: String,
    pub smtp_pass: String,
    pub from_address: String,
    pub from_name: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_pass: String::new(),
            from_address: "noreply@workhero.local".to_string(),
            from_name: "WorkHero".to_string(),
        }
    }
}

impl MailConfig {
    pub fn login(&self) -> &str {
        if self.smtp_user.is_empty() {
            &self.from_address
        } else {
            &self.smtp_user
        }
    }
}

impl WorkheroConfig {
    /// Carrega a configuração de `path`, ou de `workhero.toml` no diretório
    /// atual. Um caminho explícito inexistente é erro; o arquivo padrão
    /// ausente resulta nos valores padrão.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} not found", path.display());
                }
                Self::from_file(path)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Rejeita valores que quebrariam invariantes em tempo de execução.
    pub fn validate(&self) -> Result<()> {
        let fallback = self.price.fallback_rate;
        if !(fallback.is_finite() && fallback > 0.0) {
            bail!("price.fallback_rate must be a positive number, got {fallback}");
        }
        let tolerance = self.ledger.tolerance;
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            bail!("ledger.tolerance must not be negative, got {tolerance}");
        }
        if self.server.min_minutes == 0 || self.server.min_minutes > self.server.max_minutes {
            bail!(
                "server minutes range {}..={} is empty or starts at zero",
                self.server.min_minutes,
                self.server.max_minutes
            );
        }
        Ok(())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str::<WorkheroConfig>(&contents)
            .with_context(|| format!("parsing {}", path.display()))
    }

    /// Aplica as variáveis de ambiente sobre os valores do arquivo.
    /// Variáveis vazias são ignoradas.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(key) = var("WORKER_API_KEY") {
            self.server.worker_api_key = key.clone();
            self.worker.api_key = key;
        }
        if let Some(host) = var("SMTP_HOST") {
            self.mail.smtp_host = host;
        }
        if let Some(port) = var("SMTP_PORT") {
            self.mail.smtp_port = port
                .parse()
                .with_context(|| format!("SMTP_PORT is not a port number: {port}"))?;
        }
        if let Some(user) = var("SMTP_USER") {
            self.mail.smtp_user = user;
        }
        if let Some(pass) = var("SMTP_PASS") {
            self.mail.smtp_pass = pass;
        }
        if let Some(url) = var("SOLANA_RPC_URL") {
            self.ledger.rpc_url = url;
        }
        if let Some(url) = var("API_BASE_URL") {
            self.worker.api_base_url = url;
        }
        // Uma URL de banco seleciona o backend remoto.
        if let Some(url) = var("DATABASE_URL") {
            self.store.backend = StoreBackendKind::Remote;
            self.store.url = url;
        }
        if let Some(token) = var("DATABASE_AUTH_TOKEN") {
            self.store.auth_token = token;
        }
        if let Some(port) = var("PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("PORT is not a port number: {port}"))?;
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{host}:{port}");
        }
        Ok(())
    }
}
