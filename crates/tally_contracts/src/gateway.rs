#![forbid(unsafe_code)]

use rust_decimal::Decimal;

use crate::campaign::CampaignId;
use crate::ledger::PaymentReference;
use crate::money::{validate_non_negative_amount, CurrencyCode};
use crate::{ContractViolation, Validate};

/// Payment status as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GatewayPaymentStatus {
    Succeeded,
    Processing,
    RequiresCapture,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Canceled,
    Other(String),
}

impl GatewayPaymentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" => Self::Succeeded,
            "processing" => Self::Processing,
            "requires_capture" => Self::RequiresCapture,
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "canceled" | "cancelled" => Self::Canceled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Canceled => "canceled",
            Self::Other(s) => s.as_str(),
        }
    }

    /// Funds are authorized or committed from the gateway's side, even when final
    /// settlement is still pending.
    pub fn is_countable(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Processing | Self::RequiresCapture
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GatewayPaymentMetadata {
    pub campaign_id: Option<CampaignId>,
    pub donor_name: Option<String>,
}

/// Authoritative view of one payment as resolved from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPayment {
    pub payment_reference: PaymentReference,
    pub status: GatewayPaymentStatus,
    /// Major currency units.
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub metadata: GatewayPaymentMetadata,
}

impl Validate for GatewayPayment {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.payment_reference.validate()?;
        self.currency.validate()?;
        validate_non_negative_amount("gateway_payment.amount", self.amount)?;
        if let Some(c) = &self.metadata.campaign_id {
            c.validate()?;
        }
        Ok(())
    }
}
