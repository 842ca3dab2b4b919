//! 动态序列分析
//!
//! 分组是集合级决策：必须对一个检查的全部 MR 序列同时求值。
//! 指纹相同且多于一个的序列构成动态组，组内按 SeriesTime 升序分配时相。

use crate::config::DynamicRules;
use pacs_core::utils::parse_dicom_time;
use pacs_core::SeriesRecord;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

/// 参与动态分析的单个序列
pub(crate) struct DynamicInput<'a> {
    pub record: &'a SeriesRecord,
    pub sequence_class: &'a str,
    pub protocol_name: &'a str,
}

/// 动态分析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DynamicAssignment {
    pub group: Option<u32>,
    pub phase: Option<u32>,
    pub label: Option<String>,
    pub contrast_enhanced: bool,
}

fn cmp_time(a: Option<f64>, b: Option<f64>) -> Ordering {
    // 缺失时间排在最后
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn round_to(value: f64, decimals: u32) -> String {
    let factor = 10f64.powi(decimals as i32);
    let rounded = (value * factor).round() / factor;
    // 避免 -0.0 与 0.0 产生不同指纹
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:.*}", decimals as usize, rounded)
}

fn fingerprint(input: &DynamicInput<'_>, rules: &DynamicRules) -> String {
    rules
        .fingerprint_fields
        .iter()
        .map(|field| {
            if field == "sequenceClass" {
                return input.sequence_class.to_string();
            }
            if rules.spatial_fields.contains(field) {
                return match input.record.numbers(field) {
                    Some(values) => format!(
                        "[{}]",
                        values
                            .iter()
                            .map(|v| round_to(*v, rules.list_round_decimals))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    None if input.record.tag(field).is_some() => "INVALID".to_string(),
                    None => "NA".to_string(),
                };
            }
            match input.record.number(field) {
                Some(v) => round_to(v, rules.numeric_round_decimals),
                None => input.record.text(field).unwrap_or_else(|| "NA".to_string()),
            }
        })
        .collect::<Vec<_>>()
        .join("_")
}

fn is_contrast_enhanced(input: &DynamicInput<'_>, rules: &DynamicRules, agent_exclude: &Regex) -> bool {
    let prefix = rules.contrast.protocol_prefix.to_lowercase();
    if !input.protocol_name.starts_with(&prefix) {
        return false;
    }
    match input.record.text(&rules.contrast.agent_field) {
        Some(agent) => !agent_exclude.is_match(&agent),
        None => false,
    }
}

/// 对输入集合进行动态分组、增强判定与增强传播
///
/// 返回值与输入一一对应，另附需要写入任务日志的告警。
pub(crate) fn assign_dynamics(
    inputs: &[DynamicInput<'_>],
    rules: &DynamicRules,
    agent_exclude: &Regex,
) -> (Vec<DynamicAssignment>, Vec<String>) {
    let mut out = vec![DynamicAssignment::default(); inputs.len()];
    let mut warnings = Vec::new();

    let times: Vec<Option<f64>> = inputs
        .iter()
        .map(|i| i.record.text(&rules.ordering_field).and_then(|t| parse_dicom_time(&t)))
        .collect();

    let mut studies: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, input) in inputs.iter().enumerate() {
        studies.entry(input.record.study_uid.as_str()).or_default().push(index);
    }

    let mut next_group = 1u32;
    for (study_uid, indices) in &studies {
        let mut by_fingerprint: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &i in indices {
            if rules
                .exclude_sequence_classes
                .iter()
                .any(|c| c == inputs[i].sequence_class)
            {
                continue;
            }
            by_fingerprint.entry(fingerprint(&inputs[i], rules)).or_default().push(i);
        }

        let mut sets: Vec<(String, Vec<usize>)> = by_fingerprint
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .collect();
        let earliest = |members: &[usize]| {
            members
                .iter()
                .filter_map(|&i| times[i])
                .min_by(|a, b| a.total_cmp(b))
        };
        sets.sort_by(|(fa, ma), (fb, mb)| cmp_time(earliest(ma), earliest(mb)).then_with(|| fa.cmp(fb)));

        for (fp, mut members) in sets {
            if members.iter().all(|&i| times[i].is_none()) {
                let short: String = fp.chars().take(30).collect();
                let message = format!(
                    "检查 {} 的动态组 (指纹: {}...) 缺少有效的 {}，无法判断时相",
                    study_uid, short, rules.ordering_field
                );
                warn!("{}", message);
                warnings.push(message);
                continue;
            }

            members.sort_by(|&a, &b| {
                cmp_time(times[a], times[b])
                    .then_with(|| inputs[a].record.series_uid.cmp(&inputs[b].record.series_uid))
            });
            for (phase, &i) in members.iter().enumerate() {
                out[i].group = Some(next_group);
                out[i].phase = Some(phase as u32);
                out[i].label = Some(if phase == 0 {
                    rules.pre_label.clone()
                } else {
                    format!("{}{}", rules.post_prefix, phase)
                });
            }
            next_group += 1;
        }

        for &i in indices {
            out[i].contrast_enhanced = is_contrast_enhanced(&inputs[i], rules, agent_exclude);
        }

        // 晚于最后一个增强序列的单次 T1 序列视为延迟期增强
        let last_enhanced = indices
            .iter()
            .filter(|&&i| out[i].contrast_enhanced)
            .filter_map(|&i| times[i])
            .max_by(|a, b| a.total_cmp(b));
        if let Some(last) = last_enhanced {
            for &i in indices {
                let candidate = out[i].label.is_none()
                    && inputs[i].sequence_class.contains(&rules.propagate.t1_contains);
                if candidate && times[i].map(|t| t > last).unwrap_or(false) {
                    out[i].label = Some(rules.propagate.propagated_phase.clone());
                    out[i].contrast_enhanced = true;
                }
            }
        }
    }

    (out, warnings)
}
