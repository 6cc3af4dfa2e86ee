//! AML analysis pipeline (spec.md §4.F). Runs synchronously as a
//! post-commit hook after every completed Transaction; a failure here is
//! logged but never unwinds the wallet operation that triggered it
//! (spec.md §5: "AML analysis is triggered after, but not atomically
//! with, the wallet commit").

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::AmlConfig;
use crate::error::CoreResult;
use crate::types::{
    AlertSeverity, AlertStatus, AlertType, AmlAlert, AmlReport, AmlReportStatus, AmlReportType,
    AmlRiskProfile, AmlTransactionRecord, RiskFactorEntry, RollingWindow, Transaction,
    TransactionType,
};

/// Floor applied to a zero standard deviation when computing a z-score
/// (spec.md §9 open question: "unclear handling for zero standard
/// deviation; spec here uses a floor of 0.01").
const STD_DEV_FLOOR: f64 = 0.01;
const UNUSUAL_BETTING_Z_THRESHOLD: f64 = 2.5;
const PATTERN_DEVIATION_MIN_HISTORY: i64 = 10;

#[derive(Debug, Clone, Default)]
struct SignalScores {
    large_transaction: bool,
    structuring: bool,
    rapid_movement: bool,
    unusual_betting: bool,
    pattern_deviation_hits: u32,
    high_risk_country: bool,
    pep_match: bool,
    multi_account: bool,
}

impl SignalScores {
    fn score(&self) -> Decimal {
        let mut total = Decimal::ZERO;
        if self.large_transaction {
            total += Decimal::from(40);
        }
        if self.structuring {
            total += Decimal::from(30);
        }
        if self.rapid_movement {
            total += Decimal::from(20);
        }
        if self.unusual_betting {
            total += Decimal::from(15);
        }
        total += Decimal::from(5) * Decimal::from(self.pattern_deviation_hits);
        if self.high_risk_country {
            total += Decimal::from(25);
        }
        if self.pep_match {
            total += Decimal::from(35);
        }
        if self.multi_account {
            total += Decimal::from(30);
        }
        if self.pep_match && self.structuring {
            total += Decimal::from(30);
        }
        total.clamp(Decimal::ZERO, Decimal::from(100))
    }

    fn alert_type(&self) -> Option<AlertType> {
        if self.pep_match {
            Some(AlertType::Pep)
        } else if self.multi_account {
            Some(AlertType::MultiAccount)
        } else if self.structuring {
            Some(AlertType::Structuring)
        } else if self.large_transaction {
            Some(AlertType::LargeTransaction)
        } else if self.rapid_movement {
            Some(AlertType::RapidMovement)
        } else if self.unusual_betting {
            Some(AlertType::UnusualBetting)
        } else if self.high_risk_country {
            Some(AlertType::HighRiskCountry)
        } else if self.pattern_deviation_hits > 0 {
            Some(AlertType::PatternDeviation)
        } else {
            None
        }
    }

    fn any_high_priority_factor(&self) -> bool {
        self.pep_match || self.multi_account || self.structuring || self.large_transaction
    }

    fn factor_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.large_transaction {
            names.push("large_transaction".to_string());
        }
        if self.structuring {
            names.push("structuring".to_string());
        }
        if self.rapid_movement {
            names.push("rapid_movement".to_string());
        }
        if self.unusual_betting {
            names.push("unusual_betting".to_string());
        }
        if self.pattern_deviation_hits > 0 {
            names.push("pattern_deviation".to_string());
        }
        if self.high_risk_country {
            names.push("high_risk_country".to_string());
        }
        if self.pep_match {
            names.push("pep_match".to_string());
        }
        if self.multi_account {
            names.push("multi_account".to_string());
        }
        names
    }
}

/// External/static lookups the scoring pipeline consults (player country,
/// PEP status, linked-account count, historical game share). Kept as a
/// trait so the core crate never depends on a concrete data source.
#[async_trait::async_trait]
pub trait AmlContextProvider: Send + Sync {
    async fn player_country(&self, player_id: Uuid) -> CoreResult<Option<String>>;
    async fn is_pep(&self, player_id: Uuid) -> CoreResult<bool>;
    async fn linked_account_count(&self, player_id: Uuid) -> CoreResult<u32>;
    async fn historical_game_share(&self, player_id: Uuid, game_id: Uuid) -> CoreResult<f64>;
    async fn recent_transactions(&self, player_id: Uuid, since: DateTime<Utc>) -> CoreResult<Vec<Transaction>>;
    async fn thirty_day_bet_stats(&self, player_id: Uuid) -> CoreResult<(f64, f64)>; // (mean, stddev)
}

pub struct AmlPipeline {
    pool: PgPool,
    context: Arc<dyn AmlContextProvider>,
    config: AmlConfig,
}

impl AmlPipeline {
    pub fn new(pool: PgPool, context: Arc<dyn AmlContextProvider>, config: AmlConfig) -> Self {
        Self { pool, context, config }
    }

    pub async fn analyze(&self, transaction: &Transaction) -> CoreResult<AmlTransactionRecord> {
        if let Some(existing) = self.find_existing_record(transaction.id).await? {
            return Ok(existing);
        }

        let mut profile = self.load_or_create_profile(transaction.player_id, transaction.partner_id).await?;
        let signals = self.compute_signals(transaction, &profile).await?;
        let score = signals.score();

        let severity = self.determine_severity(score, &signals);
        let alert_type = signals.alert_type();

        let requires_alert = score >= Decimal::from(self.config.alert_score_threshold);
        let requires_report = signals.large_transaction || score >= Decimal::from(self.config.report_score_threshold);

        let mut alert_id = None;
        let mut report_id = None;

        if requires_alert {
            if let Some(alert_type) = alert_type {
                let alert = self.create_alert(transaction, alert_type, severity, score).await?;
                alert_id = Some(alert.id);
                if requires_report {
                    let report = self.create_draft_report(Some(alert.id), transaction).await?;
                    report_id = Some(report.id);
                }
            }
        }

        let record = AmlTransactionRecord {
            transaction_id: transaction.id,
            player_id: transaction.player_id,
            partner_id: transaction.partner_id,
            risk_score: score,
            risk_factors: signals.factor_names(),
            is_large_transaction: signals.large_transaction,
            requires_alert,
            requires_report,
            alert_id,
            report_id,
            analyzed_at: Utc::now(),
        };

        self.persist_record(&record).await?;
        self.update_profile(&mut profile, transaction, &signals, score).await?;

        Ok(record)
    }

    fn determine_severity(&self, score: Decimal, signals: &SignalScores) -> AlertSeverity {
        if score >= Decimal::from(85) || signals.pep_match {
            AlertSeverity::Critical
        } else if score >= Decimal::from(70) {
            AlertSeverity::High
        } else if score >= Decimal::from(60) && signals.any_high_priority_factor() {
            AlertSeverity::High
        } else if score >= Decimal::from(40) {
            AlertSeverity::Medium
        } else {
            AlertSeverity::Low
        }
    }

    async fn compute_signals(&self, transaction: &Transaction, profile: &AmlRiskProfile) -> CoreResult<SignalScores> {
        let mut signals = SignalScores::default();

        let threshold = self
            .config
            .thresholds_by_currency
            .get(&transaction.currency)
            .copied()
            .unwrap_or(self.config.default_threshold);
        signals.large_transaction = transaction.amount >= threshold;

        let since_48h = Utc::now() - Duration::hours(48);
        let recent = self.context.recent_transactions(transaction.player_id, since_48h).await?;
        let near_threshold_count = recent
            .iter()
            .filter(|t| {
                let ratio = t.amount / threshold;
                ratio >= Decimal::new(70, 2) && ratio <= Decimal::new(99, 2)
            })
            .count();
        signals.structuring = near_threshold_count >= 3;

        let since_24h = Utc::now() - Duration::hours(24);
        let deposits_24h: Decimal = recent
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Deposit && t.created_at >= since_24h)
            .map(|t| t.amount)
            .sum();
        let withdrawals_24h: Decimal = recent
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Withdrawal && t.created_at >= since_24h)
            .map(|t| t.amount)
            .sum();
        signals.rapid_movement = deposits_24h > Decimal::ZERO && withdrawals_24h >= deposits_24h * Decimal::new(80, 2);

        if transaction.transaction_type == TransactionType::Bet {
            let (mean, stddev) = self.context.thirty_day_bet_stats(transaction.player_id).await?;
            let amount_f64 = transaction.amount.to_f64().unwrap_or(0.0);
            let z = z_score(amount_f64, mean, stddev);
            let low_share = match transaction.game_id {
                Some(game_id) => self.context.historical_game_share(transaction.player_id, game_id).await? < 0.05,
                None => false,
            };
            signals.unusual_betting = z > UNUSUAL_BETTING_Z_THRESHOLD || low_share;
        }

        let history_count = profile.window_30d.deposit_count + profile.window_30d.withdrawal_count;
        if history_count as i64 >= PATTERN_DEVIATION_MIN_HISTORY {
            let hour = transaction.created_at.format("%H").to_string().parse::<u32>().unwrap_or(12);
            if !(6..=23).contains(&hour) {
                signals.pattern_deviation_hits += 1;
            }
            let (mean, stddev) = self.context.thirty_day_bet_stats(transaction.player_id).await?;
            let amount_f64 = transaction.amount.to_f64().unwrap_or(0.0);
            if z_score(amount_f64, mean, stddev) > UNUSUAL_BETTING_Z_THRESHOLD {
                signals.pattern_deviation_hits += 1;
            }
            let count_24h = recent.iter().filter(|t| t.created_at >= since_24h).count() as f64;
            let baseline = (history_count as f64 / 30.0).max(1.0);
            let day_count = count_24h.max(1.0);
            if count_24h / baseline > 3.0 && day_count > 3.0 {
                signals.pattern_deviation_hits += 1;
            }
        }

        if let Some(country) = self.context.player_country(transaction.player_id).await? {
            signals.high_risk_country = self.config.high_risk_countries.iter().any(|c| c == &country);
        }
        signals.pep_match = self.context.is_pep(transaction.player_id).await?;
        signals.multi_account = self.context.linked_account_count(transaction.player_id).await? > 1;

        Ok(signals)
    }

    async fn find_existing_record(&self, transaction_id: Uuid) -> CoreResult<Option<AmlTransactionRecord>> {
        let row = sqlx::query_as::<_, AmlTransactionRow>(
            "SELECT transaction_id, player_id, partner_id, risk_score, risk_factors, is_large_transaction,
                    requires_alert, requires_report, alert_id, report_id, analyzed_at
             FROM aml_transactions WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn persist_record(&self, record: &AmlTransactionRecord) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO aml_transactions
             (transaction_id, player_id, partner_id, risk_score, risk_factors, is_large_transaction,
              requires_alert, requires_report, alert_id, report_id, analyzed_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(record.transaction_id)
        .bind(record.player_id)
        .bind(record.partner_id)
        .bind(record.risk_score)
        .bind(&record.risk_factors)
        .bind(record.is_large_transaction)
        .bind(record.requires_alert)
        .bind(record.requires_report)
        .bind(record.alert_id)
        .bind(record.report_id)
        .bind(record.analyzed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_or_create_profile(&self, player_id: Uuid, partner_id: Uuid) -> CoreResult<AmlRiskProfile> {
        let row = sqlx::query_as::<_, AmlProfileRow>(
            "SELECT id, player_id, partner_id, window_7d, window_30d, wager_to_deposit_ratio,
                    withdrawal_to_deposit_ratio, overall_risk_score, deposit_risk_score,
                    withdrawal_risk_score, gameplay_risk_score, risk_factors, last_assessment_at
             FROM aml_risk_profiles WHERE player_id = $1 AND partner_id = $2",
        )
        .bind(player_id)
        .bind(partner_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(row.into());
        }

        let profile = AmlRiskProfile {
            id: Uuid::new_v4(),
            player_id,
            partner_id,
            window_7d: RollingWindow::default(),
            window_30d: RollingWindow::default(),
            wager_to_deposit_ratio: Decimal::ZERO,
            withdrawal_to_deposit_ratio: Decimal::ZERO,
            overall_risk_score: Decimal::ZERO,
            deposit_risk_score: Decimal::ZERO,
            withdrawal_risk_score: Decimal::ZERO,
            gameplay_risk_score: Decimal::ZERO,
            risk_factors: BTreeMap::new(),
            last_assessment_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO aml_risk_profiles
             (id, player_id, partner_id, window_7d, window_30d, wager_to_deposit_ratio,
              withdrawal_to_deposit_ratio, overall_risk_score, deposit_risk_score,
              withdrawal_risk_score, gameplay_risk_score, risk_factors, last_assessment_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(profile.id)
        .bind(profile.player_id)
        .bind(profile.partner_id)
        .bind(serde_json::to_value(&profile.window_7d)?)
        .bind(serde_json::to_value(&profile.window_30d)?)
        .bind(profile.wager_to_deposit_ratio)
        .bind(profile.withdrawal_to_deposit_ratio)
        .bind(profile.overall_risk_score)
        .bind(profile.deposit_risk_score)
        .bind(profile.withdrawal_risk_score)
        .bind(profile.gameplay_risk_score)
        .bind(serde_json::to_value(&profile.risk_factors)?)
        .bind(profile.last_assessment_at)
        .execute(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn create_alert(
        &self,
        transaction: &Transaction,
        alert_type: AlertType,
        severity: AlertSeverity,
        score: Decimal,
    ) -> CoreResult<AmlAlert> {
        let alert = AmlAlert {
            id: Uuid::new_v4(),
            player_id: transaction.player_id,
            partner_id: transaction.partner_id,
            alert_type,
            severity,
            status: AlertStatus::New,
            risk_score_at_alert: score,
            related_transaction_ids: vec![transaction.id],
            reviewer_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            reported_at: None,
        };
        sqlx::query(
            "INSERT INTO aml_alerts
             (id, player_id, partner_id, alert_type, severity, status, risk_score_at_alert,
              related_transaction_ids, reviewer_notes, created_at, updated_at, reported_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(alert.id)
        .bind(alert.player_id)
        .bind(alert.partner_id)
        .bind(alert.alert_type.to_string())
        .bind(alert.severity)
        .bind(alert.status)
        .bind(alert.risk_score_at_alert)
        .bind(&alert.related_transaction_ids)
        .bind(&alert.reviewer_notes)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .bind(alert.reported_at)
        .execute(&self.pool)
        .await?;
        Ok(alert)
    }

    async fn create_draft_report(&self, alert_id: Option<Uuid>, transaction: &Transaction) -> CoreResult<AmlReport> {
        let report = AmlReport {
            id: Uuid::new_v4(),
            alert_id,
            report_type: AmlReportType::Sar,
            jurisdiction: transaction.currency.clone(),
            status: AmlReportStatus::Draft,
            submission_reference: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO aml_reports (id, alert_id, report_type, jurisdiction, status, submission_reference, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(report.id)
        .bind(report.alert_id)
        .bind(report.report_type)
        .bind(&report.jurisdiction)
        .bind(report.status)
        .bind(&report.submission_reference)
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;
        Ok(report)
    }

    /// Exponential moving average (0.7 old / 0.3 new) over the per-category
    /// risk scores, plus rolling-window bookkeeping (spec.md §4.F step 9).
    async fn update_profile(
        &self,
        profile: &mut AmlRiskProfile,
        transaction: &Transaction,
        signals: &SignalScores,
        score: Decimal,
    ) -> CoreResult<()> {
        let now = Utc::now();
        match transaction.transaction_type {
            TransactionType::Deposit => {
                profile.window_7d.deposit_count += 1;
                profile.window_7d.deposit_amount += transaction.amount;
                profile.window_30d.deposit_count += 1;
                profile.window_30d.deposit_amount += transaction.amount;
            }
            TransactionType::Withdrawal => {
                profile.window_7d.withdrawal_count += 1;
                profile.window_7d.withdrawal_amount += transaction.amount;
                profile.window_30d.withdrawal_count += 1;
                profile.window_30d.withdrawal_amount += transaction.amount;
            }
            _ => {}
        }

        if profile.window_30d.deposit_amount > Decimal::ZERO {
            profile.withdrawal_to_deposit_ratio = profile.window_30d.withdrawal_amount / profile.window_30d.deposit_amount;
        }

        let ema_weight_old = Decimal::new(7, 1);
        let ema_weight_new = Decimal::new(3, 1);
        profile.overall_risk_score = profile.overall_risk_score * ema_weight_old + score * ema_weight_new;

        for name in signals.factor_names() {
            profile
                .risk_factors
                .entry(name)
                .and_modify(|entry| {
                    entry.last_detected = now;
                    entry.count += 1;
                })
                .or_insert(RiskFactorEntry {
                    first_detected: now,
                    last_detected: now,
                    count: 1,
                });
        }
        profile.last_assessment_at = now;

        sqlx::query(
            "UPDATE aml_risk_profiles SET
               window_7d = $1, window_30d = $2, wager_to_deposit_ratio = $3,
               withdrawal_to_deposit_ratio = $4, overall_risk_score = $5, risk_factors = $6,
               last_assessment_at = $7
             WHERE id = $8",
        )
        .bind(serde_json::to_value(&profile.window_7d)?)
        .bind(serde_json::to_value(&profile.window_30d)?)
        .bind(profile.wager_to_deposit_ratio)
        .bind(profile.withdrawal_to_deposit_ratio)
        .bind(profile.overall_risk_score)
        .bind(serde_json::to_value(&profile.risk_factors)?)
        .bind(profile.last_assessment_at)
        .bind(profile.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn z_score(value: f64, mean: f64, stddev: f64) -> f64 {
    let floored = stddev.max(STD_DEV_FLOOR);
    (value - mean) / floored
}

#[derive(sqlx::FromRow)]
struct AmlTransactionRow {
    transaction_id: Uuid,
    player_id: Uuid,
    partner_id: Uuid,
    risk_score: Decimal,
    risk_factors: Vec<String>,
    is_large_transaction: bool,
    requires_alert: bool,
    requires_report: bool,
    alert_id: Option<Uuid>,
    report_id: Option<Uuid>,
    analyzed_at: DateTime<Utc>,
}

impl From<AmlTransactionRow> for AmlTransactionRecord {
    fn from(row: AmlTransactionRow) -> Self {
        AmlTransactionRecord {
            transaction_id: row.transaction_id,
            player_id: row.player_id,
            partner_id: row.partner_id,
            risk_score: row.risk_score,
            risk_factors: row.risk_factors,
            is_large_transaction: row.is_large_transaction,
            requires_alert: row.requires_alert,
            requires_report: row.requires_report,
            alert_id: row.alert_id,
            report_id: row.report_id,
            analyzed_at: row.analyzed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AmlProfileRow {
    id: Uuid,
    player_id: Uuid,
    partner_id: Uuid,
    window_7d: serde_json::Value,
    window_30d: serde_json::Value,
    wager_to_deposit_ratio: Decimal,
    withdrawal_to_deposit_ratio: Decimal,
    overall_risk_score: Decimal,
    deposit_risk_score: Decimal,
    withdrawal_risk_score: Decimal,
    gameplay_risk_score: Decimal,
    risk_factors: serde_json::Value,
    last_assessment_at: DateTime<Utc>,
}

impl From<AmlProfileRow> for AmlRiskProfile {
    fn from(row: AmlProfileRow) -> Self {
        AmlRiskProfile {
            id: row.id,
            player_id: row.player_id,
            partner_id: row.partner_id,
            window_7d: serde_json::from_value(row.window_7d).unwrap_or_default(),
            window_30d: serde_json::from_value(row.window_30d).unwrap_or_default(),
            wager_to_deposit_ratio: row.wager_to_deposit_ratio,
            withdrawal_to_deposit_ratio: row.withdrawal_to_deposit_ratio,
            overall_risk_score: row.overall_risk_score,
            deposit_risk_score: row.deposit_risk_score,
            withdrawal_risk_score: row.withdrawal_risk_score,
            gameplay_risk_score: row.gameplay_risk_score,
            risk_factors: serde_json::from_value(row.risk_factors).unwrap_or_default(),
            last_assessment_at: row.last_assessment_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_clamps_to_one_hundred() {
        let signals = SignalScores {
            large_transaction: true,
            structuring: true,
            rapid_movement: true,
            unusual_betting: true,
            pattern_deviation_hits: 3,
            high_risk_country: true,
            pep_match: true,
            multi_account: true,
        };
        assert_eq!(signals.score(), Decimal::from(100));
    }

    #[test]
    fn alert_type_priority_order() {
        let mut signals = SignalScores::default();
        signals.large_transaction = true;
        signals.structuring = true;
        assert_eq!(signals.alert_type(), Some(AlertType::Structuring));
        signals.pep_match = true;
        assert_eq!(signals.alert_type(), Some(AlertType::Pep));
    }

    #[test]
    fn severity_boundaries() {
        let signals = SignalScores::default();
        let pipeline_severity = |score: Decimal, signals: &SignalScores| {
            if score >= Decimal::from(85) || signals.pep_match {
                AlertSeverity::Critical
            } else if score >= Decimal::from(70) {
                AlertSeverity::High
            } else if score >= Decimal::from(60) && signals.any_high_priority_factor() {
                AlertSeverity::High
            } else if score >= Decimal::from(40) {
                AlertSeverity::Medium
            } else {
                AlertSeverity::Low
            }
        };
        assert_eq!(pipeline_severity(Decimal::from(40), &signals), AlertSeverity::Medium);
        assert_eq!(pipeline_severity(Decimal::from(39), &signals), AlertSeverity::Low);
        assert_eq!(pipeline_severity(Decimal::from(85), &signals), AlertSeverity::Critical);
    }

    #[test]
    fn z_score_floors_zero_stddev() {
        let z = z_score(10.0, 0.0, 0.0);
        assert_eq!(z, 10.0 / STD_DEV_FLOOR);
    }
}
