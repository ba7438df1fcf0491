//! 验证：判断一次工具结果是否可作为最终回答的依据

use crate::tools::ToolResult;

pub trait Verifier: Send + Sync {
    fn verify(&self, result: &ToolResult) -> bool;
}

/// 默认谓词：结果成功且没有错误信息
#[derive(Debug, Clone, Copy, Default)]
pub struct SuccessFlagVerifier;

impl Verifier for SuccessFlagVerifier {
    fn verify(&self, result: &ToolResult) -> bool {
        result.success && result.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_flag() {
        let v = SuccessFlagVerifier;
        assert!(v.verify(&ToolResult::ok(json!(12345))));
        assert!(!v.verify(&ToolResult::failure("Column 'x' not found", None)));
        let odd = ToolResult {
            success: true,
            error: Some("partial".into()),
            ..Default::default()
        };
        assert!(!v.verify(&odd));
    }
}
