use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------
// Partner
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "partner_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PartnerType {
    Operator,
    Aggregator,
    Affiliate,
    PaymentProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "partner_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PartnerStatus {
    Pending,
    Active,
    Inactive,
    Suspended,
    Terminated,
}

impl PartnerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Commission model attached to a partner, normalized to a structured
/// `{model, rate}` pair rather than a free-form string so settlement
/// reporting can rely on `rate` being a real `Decimal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionModel {
    pub model: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub id: Uuid,
    pub short_code: String,
    pub partner_type: PartnerType,
    pub status: PartnerStatus,
    pub commission: CommissionModel,
    pub contact_email: String,
    pub contract_start: Option<DateTime<Utc>>,
    pub contract_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// ApiKey / PartnerIP
// ---------------------------------------------------------------------

/// Plaintext API secret, returned exactly once at creation and never
/// persisted. Holding this in a dedicated type keeps it from being
/// accidentally logged or serialized alongside `ApiKey`.
#[derive(Debug, Clone)]
pub struct PlaintextApiSecret(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub key_prefix: String,
    pub secret_hash: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerIp {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub cidr: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Wallet / Transaction
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub currency: String,
    pub balance: Decimal,
    pub active: bool,
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn is_usable(&self) -> bool {
        self.active && !self.locked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Bet,
    Win,
    Refund,
    Rollback,
    Adjustment,
    Bonus,
    Commission,
}

impl TransactionType {
    /// Credit-type operations create the wallet with balance 0 if absent;
    /// debit-type operations fail `WalletNotFound` (spec.md §4.D step 3).
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            Self::Deposit | Self::Win | Self::Bonus | Self::Adjustment
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub reference_id: String,
    pub wallet_id: Uuid,
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub original_balance: Decimal,
    pub updated_balance: Decimal,
    pub game_id: Option<Uuid>,
    pub game_session_id: Option<Uuid>,
    pub original_transaction_id: Option<Uuid>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a wallet operation, returned to the caller and cached for
/// idempotent replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletOperationResult {
    pub balance: Decimal,
    pub currency: String,
    pub reference_id: String,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletOperationRequest {
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub currency: String,
    pub amount: Decimal,
    pub reference_id: String,
    pub transaction_type: TransactionType,
    pub game_id: Option<Uuid>,
    pub game_session_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub reference_id: String,
    pub original_reference_id: String,
}

// ---------------------------------------------------------------------
// Game catalog / provider
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "integration_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    Direct,
    Aggregator,
    Iframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "provider_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameProvider {
    pub id: Uuid,
    pub code: String,
    pub integration_type: IntegrationType,
    pub api_endpoint: String,
    pub api_key: String,
    pub api_secret: String,
    pub status: ProviderStatus,
    pub supported_currencies: Vec<String>,
    pub supported_languages: Vec<String>,
}

impl GameProvider {
    pub fn is_active(&self) -> bool {
        matches!(self.status, ProviderStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "game_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub game_code: String,
    pub category: String,
    pub status: GameStatus,
    pub rtp: Decimal,
    pub min_bet: Decimal,
    pub max_bet: Decimal,
    pub features: Vec<String>,
}

impl Game {
    pub fn is_active(&self) -> bool {
        matches!(self.status, GameStatus::Active)
    }
}

// ---------------------------------------------------------------------
// Game session / game transaction
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "game_session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GameSessionStatus {
    Active,
    Ended,
    Expired,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSessionData {
    pub currency: String,
    pub language: String,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSession {
    pub id: Uuid,
    pub token: String,
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub game_id: Uuid,
    pub status: GameSessionStatus,
    pub session_data: GameSessionData,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl GameSession {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, GameSessionStatus::Active) && self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "callback_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallbackAction {
    Bet,
    Win,
    Refund,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameTransaction {
    pub id: Uuid,
    pub reference_id: String,
    pub game_session_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub round_id: String,
    pub action: CallbackAction,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Inbound provider callback envelope (spec.md §6's provider callback
/// protocol), parsed from the raw request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub token: String,
    pub action: CallbackAction,
    pub round_id: String,
    pub reference_id: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub timestamp: i64,
    pub nonce: String,
    #[serde(default)]
    pub game_data: Value,
    pub original_reference_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub status: &'static str,
    pub balance: Decimal,
    pub currency: String,
    pub transaction_id: Uuid,
}

// ---------------------------------------------------------------------
// AML
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RollingWindow {
    pub deposit_count: u32,
    pub deposit_amount: Decimal,
    pub withdrawal_count: u32,
    pub withdrawal_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlRiskProfile {
    pub id: Uuid,
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub window_7d: RollingWindow,
    pub window_30d: RollingWindow,
    pub wager_to_deposit_ratio: Decimal,
    pub withdrawal_to_deposit_ratio: Decimal,
    pub overall_risk_score: Decimal,
    pub deposit_risk_score: Decimal,
    pub withdrawal_risk_score: Decimal,
    pub gameplay_risk_score: Decimal,
    pub risk_factors: BTreeMap<String, RiskFactorEntry>,
    pub last_assessment_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactorEntry {
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Investigating,
    PendingReport,
    Reported,
    ClosedFalsePositive,
    ClosedConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Pep,
    MultiAccount,
    Structuring,
    LargeTransaction,
    RapidMovement,
    UnusualBetting,
    HighRiskCountry,
    PatternDeviation,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pep => "pep",
            Self::MultiAccount => "multi_account",
            Self::Structuring => "structuring",
            Self::LargeTransaction => "large_transaction",
            Self::RapidMovement => "rapid_movement",
            Self::UnusualBetting => "unusual_betting",
            Self::HighRiskCountry => "high_risk_country",
            Self::PatternDeviation => "pattern_deviation",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlAlert {
    pub id: Uuid,
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub risk_score_at_alert: Decimal,
    pub related_transaction_ids: Vec<Uuid>,
    pub reviewer_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "report_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AmlReportType {
    Sar,
    Ctr,
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "aml_report_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AmlReportStatus {
    Draft,
    Submitted,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlReport {
    pub id: Uuid,
    pub alert_id: Option<Uuid>,
    pub report_type: AmlReportType,
    pub jurisdiction: String,
    pub status: AmlReportStatus,
    pub submission_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlTransactionRecord {
    pub transaction_id: Uuid,
    pub player_id: Uuid,
    pub partner_id: Uuid,
    pub risk_score: Decimal,
    pub risk_factors: Vec<String>,
    pub is_large_transaction: bool,
    pub requires_alert: bool,
    pub requires_report: bool,
    pub alert_id: Option<Uuid>,
    pub report_id: Option<Uuid>,
    pub analyzed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Reporting scheduler
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "report_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Output format a report is rendered in; drives the download endpoint's
/// `Content-Type` (spec.md §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "report_format", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Csv,
    Pdf,
    Xlsx,
    Json,
}

impl ReportFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Csv => "text/csv",
            Self::Pdf => "application/pdf",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::Json => "application/json",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Pdf => "pdf",
            Self::Xlsx => "xlsx",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub report_kind: String,
    pub format: ReportFormat,
    pub parameters: Value,
    pub status: ReportJobStatus,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub partner_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub request_body: Option<Value>,
    pub response_body: Option<Value>,
}

// ---------------------------------------------------------------------
// Request scope — threaded through the admission pipeline
// ---------------------------------------------------------------------

use crate::permissions::PermissionSet;

/// Immutable per-request context produced by the admission pipeline and
/// passed explicitly into handlers, replacing thread/async-local state
/// (Design note 3).
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub request_id: Uuid,
    pub partner_id: Uuid,
    pub api_key_id: Uuid,
    pub permissions: PermissionSet,
    pub client_ip: String,
}
