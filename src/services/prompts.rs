//! 提示词构建
//!
//! 检测（agent1）和验证（agent2）两段提示词。两者都要求模型只返回 JSON，
//! 列表键分别是 `candidates` 和 `metaphors`，与解析器的期望一致。

use crate::models::CandidateMetaphor;

const VALID_EXAMPLES: &str = r#"VALID METAPHORS (physical domain -> financial domain):
- "fire sales": FIRE (consumes quickly, destructive) -> SALES (quick, destroy value)
- "weather a downturn": STORM (resist natural elements) -> CRISIS (resist economic difficulties)
- "tangled and opaque picture": TANGLED PHYSICAL OBJECT -> COMPLEX MARKET
- "hub-and-spoke network": PHYSICAL WHEEL -> MARKET STRUCTURE
- "feedback loop": MECHANICAL SYSTEM -> ECONOMIC SYSTEM
- "buildup of risk": PHYSICAL ACCUMULATION -> RISK ACCUMULATION
- "near collapse": PHYSICAL STRUCTURE FALLING -> FINANCIAL SYSTEM FAILING"#;

const INVALID_EXAMPLES: &str = r#"INVALID EXPRESSIONS (reject these types):
- "take stock", "move forward", "make progress": common idioms, no systematic mapping
- "market participants", "financial institutions": normal technical terminology
- "regulatory framework", "liquidity provision", "access to capital": standard financial concepts
- "under the right circumstances", "address issues": ordinary language"#;

/// 检测阶段提示词
pub fn build_detection_prompt(text: &str) -> String {
    format!(
        r#"Analyze the following text:

{text}

You are a linguistics expert who identifies ONLY very specific conceptual metaphors.

STRICT RULE: only report metaphors that EXPLICITLY map physical/concrete concepts
(weather, construction, machines, fire, ...) onto financial/abstract concepts,
creating a systematic conceptual mapping.

Do NOT include common idioms ("build up", "take stock", "move forward") or standard
financial terminology ("market participants", "regulatory framework").
If you find more than 5 metaphors, you are being too permissive.

Respond with JSON only, in this format:
{{
    "candidates": [
        {{
            "text": "exact metaphor text",
            "context": "complete sentence where it appears",
            "source_domain": "physical source domain"
        }}
    ]
}}
"#
    )
}

/// 验证阶段提示词
pub fn build_validation_prompt(candidates: &[CandidateMetaphor]) -> String {
    let candidates_json = serde_json::to_string_pretty(candidates).unwrap_or_default();

    format!(
        r#"YOU ARE AGENT 2: EXPERT FILTER FOR CONCEPTUAL METAPHORS

Agent 1 identified these candidates:
{candidates_json}

Keep ONLY true conceptual metaphors. A metaphor must map a specific PHYSICAL/CONCRETE
domain onto an ABSTRACT/FINANCIAL one, and the mapping must be systematic.

{VALID_EXAMPLES}

{INVALID_EXAMPLES}

Rules:
- Only approve candidates from the list above, copying their "text" exactly
- If you have doubts about a candidate, reject it
- Approve at most 5 metaphors

Respond with JSON only, in this format:
{{
    "metaphors": [
        {{
            "text": "approved metaphor",
            "context": "complete sentence where it appears"
        }}
    ]
}}
"#
    )
}
