//! Request fingerprints and the parameters that define them

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Payment mode of an introductory or promotional price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    PayAsYouGo,
    PayUpFront,
    FreeTrial,
}

impl PaymentMode {
    fn tag(self) -> u8 {
        match self {
            Self::PayAsYouGo => 0,
            Self::PayUpFront => 1,
            Self::FreeTrial => 2,
        }
    }
}

/// A promotional offer attached to a product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscountInfo {
    pub identifier: String,
    pub price_micros: i64,
    pub payment_mode: Option<PaymentMode>,
    pub number_of_periods: u32,
}

/// Priced product metadata accompanying a purchase post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductInfo {
    pub product_identifier: String,
    /// Price in millionths of the currency unit.
    pub price_micros: i64,
    pub currency_code: String,
    pub payment_mode: Option<PaymentMode>,
    pub introductory_price_micros: Option<i64>,
    pub subscription_group: Option<String>,
    pub discounts: Vec<DiscountInfo>,
}

impl ProductInfo {
    pub fn new(product_identifier: impl Into<String>, price_micros: i64, currency_code: impl Into<String>) -> Self {
        Self {
            product_identifier: product_identifier.into(),
            price_micros,
            currency_code: currency_code.into(),
            payment_mode: None,
            introductory_price_micros: None,
            subscription_group: None,
            discounts: Vec::new(),
        }
    }
}

/// A completed store transaction as handed over by the purchase flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionDescriptor {
    /// Opaque receipt bytes produced by the platform.
    pub receipt: Vec<u8>,
    pub is_restore: bool,
    pub product: Option<ProductInfo>,
    pub presented_offering_identifier: Option<String>,
    pub observer_mode: bool,
}

impl TransactionDescriptor {
    pub fn new(receipt: impl Into<Vec<u8>>) -> Self {
        Self {
            receipt: receipt.into(),
            is_restore: false,
            product: None,
            presented_offering_identifier: None,
            observer_mode: false,
        }
    }

    pub fn with_product(mut self, product: ProductInfo) -> Self {
        self.product = Some(product);
        self
    }

    pub fn with_restore(mut self, is_restore: bool) -> Self {
        self.is_restore = is_restore;
        self
    }

    pub fn with_presented_offering(mut self, identifier: impl Into<String>) -> Self {
        self.presented_offering_identifier = Some(identifier.into());
        self
    }

    pub fn with_observer_mode(mut self, observer_mode: bool) -> Self {
        self.observer_mode = observer_mode;
        self
    }
}

/// Everything that defines the outcome of a transaction post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurchaseParams {
    pub app_user_id: String,
    pub descriptor: TransactionDescriptor,
}

impl PurchaseParams {
    pub fn new(app_user_id: impl Into<String>, descriptor: TransactionDescriptor) -> Self {
        Self {
            app_user_id: app_user_id.into(),
            descriptor,
        }
    }

    pub fn fingerprint(&self) -> RequestFingerprint {
        RequestFingerprint::purchase(self)
    }
}

/// Which backend operation a fingerprint identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationTag {
    CustomerState = 1,
    Purchase = 2,
}

/// SHA-256 digest over every outcome-affecting parameter of a backend call.
///
/// Equal fingerprints mean "the same logical call"; the coalescer uses no
/// other criterion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestFingerprint([u8; 32]);

impl RequestFingerprint {
    /// Fingerprint of a customer state fetch: the owner alone.
    pub fn customer_state(app_user_id: &str) -> Self {
        let mut hasher = FingerprintHasher::new(OperationTag::CustomerState);
        hasher.str(app_user_id);
        hasher.finish()
    }

    /// Fingerprint of a transaction post.
    pub fn purchase(params: &PurchaseParams) -> Self {
        let descriptor = &params.descriptor;
        let mut hasher = FingerprintHasher::new(OperationTag::Purchase);
        hasher.str(&params.app_user_id);
        hasher.bytes(&descriptor.receipt);
        hasher.flag(descriptor.is_restore);
        hasher.flag(descriptor.observer_mode);
        hasher.opt_str(descriptor.presented_offering_identifier.as_deref());
        match &descriptor.product {
            None => hasher.flag(false),
            Some(product) => {
                hasher.flag(true);
                hasher.str(&product.product_identifier);
                hasher.int(product.price_micros);
                hasher.str(&product.currency_code);
                hasher.opt_payment_mode(product.payment_mode);
                match product.introductory_price_micros {
                    None => hasher.flag(false),
                    Some(price) => {
                        hasher.flag(true);
                        hasher.int(price);
                    }
                }
                hasher.opt_str(product.subscription_group.as_deref());
                hasher.len(product.discounts.len());
                for discount in &product.discounts {
                    hasher.str(&discount.identifier);
                    hasher.int(discount.price_micros);
                    hasher.opt_payment_mode(discount.payment_mode);
                    hasher.int(i64::from(discount.number_of_periods));
                }
            }
        }
        hasher.finish()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 bytes are plenty to tell fingerprints apart in logs.
        write!(f, "RequestFingerprint({})", hex::encode(&self.0[..8]))
    }
}

/// Length-prefixed field encoder so adjacent fields cannot run together.
struct FingerprintHasher(Sha256);

impl FingerprintHasher {
    fn new(tag: OperationTag) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([tag as u8]);
        Self(hasher)
    }

    fn len(&mut self, len: usize) {
        self.0.update((len as u64).to_be_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.len(bytes.len());
        self.0.update(bytes);
    }

    fn str(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn opt_str(&mut self, value: Option<&str>) {
        match value {
            None => self.flag(false),
            Some(value) => {
                self.flag(true);
                self.str(value);
            }
        }
    }

    fn flag(&mut self, value: bool) {
        self.0.update([u8::from(value)]);
    }

    fn int(&mut self, value: i64) {
        self.0.update(value.to_be_bytes());
    }

    fn opt_payment_mode(&mut self, mode: Option<PaymentMode>) {
        match mode {
            None => self.0.update([0xFF]),
            Some(mode) => self.0.update([mode.tag()]),
        }
    }

    fn finish(self) -> RequestFingerprint {
        let digest = self.0.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        RequestFingerprint(out)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PurchaseParams {
        let mut product = ProductInfo::new("com.app.monthly", 4_990_000, "USD");
        product.subscription_group = Some("group-1".to_string());
        product.discounts.push(DiscountInfo {
            identifier: "winback".to_string(),
            price_micros: 990_000,
            payment_mode: Some(PaymentMode::PayUpFront),
            number_of_periods: 1,
        });
        PurchaseParams::new(
            "u1",
            TransactionDescriptor::new(b"receipt".to_vec())
                .with_product(product)
                .with_presented_offering("default"),
        )
    }

    #[test]
    fn test_identical_params_identical_fingerprint() {
        assert_eq!(params().fingerprint(), params().fingerprint());
    }

    #[test]
    fn test_each_parameter_changes_fingerprint() {
        let base = params().fingerprint();

        let mut p = params();
        p.descriptor.is_restore = true;
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.observer_mode = true;
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.presented_offering_identifier = None;
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.app_user_id = "u2".to_string();
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.receipt = b"other".to_vec();
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.product.as_mut().unwrap().currency_code = "EUR".to_string();
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.product.as_mut().unwrap().introductory_price_micros = Some(0);
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.product.as_mut().unwrap().payment_mode = Some(PaymentMode::FreeTrial);
        assert_ne!(p.fingerprint(), base);

        let mut p = params();
        p.descriptor.product.as_mut().unwrap().discounts.clear();
        assert_ne!(p.fingerprint(), base);
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        let mut a = params();
        a.app_user_id = "ab".to_string();
        a.descriptor.receipt = b"c".to_vec();
        let mut b = params();
        b.app_user_id = "a".to_string();
        b.descriptor.receipt = b"bc".to_vec();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_operation_kinds_are_distinct() {
        let mut purchase = params();
        purchase.app_user_id = "a".to_string();
        assert_ne!(
            RequestFingerprint::customer_state("a"),
            RequestFingerprint::purchase(&purchase)
        );
        assert_ne!(
            RequestFingerprint::customer_state("a"),
            RequestFingerprint::customer_state("b")
        );
    }

    #[test]
    fn test_display_is_hex() {
        let fp = RequestFingerprint::customer_state("u1");
        let text = fp.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(format!("{:?}", fp).starts_with("RequestFingerprint("));
    }
}
