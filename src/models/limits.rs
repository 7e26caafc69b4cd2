//! 已知模型的免费额度
//!
//! 只用于推导默认的合并上限（两个模型取最严格值）。

use phf::phf_map;

/// 单个模型的请求额度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelQuota {
    pub rpm: u32,
    pub tpm: u64,
    pub rpd: u32,
}

static KNOWN_MODEL_QUOTAS: phf::Map<&'static str, ModelQuota> = phf_map! {
    "gemini-2.0-flash" => ModelQuota { rpm: 15, tpm: 1_000_000, rpd: 200 },
    "gemini-2.5-flash" => ModelQuota { rpm: 10, tpm: 250_000, rpd: 250 },
    "gemini-2.5-flash-lite" => ModelQuota { rpm: 15, tpm: 250_000, rpd: 1_000 },
    "gemini-2.5-pro" => ModelQuota { rpm: 5, tpm: 250_000, rpd: 100 },
};

/// 查询模型额度
pub fn quota_for(model: &str) -> Option<ModelQuota> {
    KNOWN_MODEL_QUOTAS.get(model).copied()
}

/// 两个模型合并后的（rpm, rpd）上限
///
/// 未知模型不参与计算；两个都未知时返回 `None`。
pub fn combined_quota(detector: &str, validator: &str) -> Option<(u32, u32)> {
    [quota_for(detector), quota_for(validator)]
        .into_iter()
        .flatten()
        .fold(None, |acc, q| match acc {
            None => Some((q.rpm, q.rpd)),
            Some((rpm, rpd)) => Some((rpm.min(q.rpm), rpd.min(q.rpd))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_quota_takes_most_restrictive() {
        assert_eq!(
            combined_quota("gemini-2.0-flash", "gemini-2.5-flash"),
            Some((10, 200))
        );
    }

    #[test]
    fn test_combined_quota_ignores_unknown_models() {
        assert_eq!(combined_quota("my-local-model", "gemini-2.5-pro"), Some((5, 100)));
        assert_eq!(combined_quota("a", "b"), None);
    }
}
