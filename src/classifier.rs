//! 分類モデルの出力から上位のクラスを求めるモジュール

use serde::{Deserialize, Serialize};

use crate::error::{PostError, Result};
use crate::tensor::TensorView;

/// 1クラスのスコア
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub class: i32,
    pub score: f32,
}

/// 分類結果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassifierTopN {
    /// クラス数
    pub top_n_num: u32,
    /// スコアの降順に並んだ結果
    pub results: Vec<ClassScore>,
}

/// 出力テンソル (1 x C, または 1 x C x 1 x 1) にソフトマックスをかけ, スコア順に並べます。
///
/// # Args
/// * `view` - 分類モデルの出力テンソル
///
/// # Return
/// * 分類結果
pub fn classifier_top_n(view: &TensorView) -> Result<ClassifierTopN> {
    let shape = &view.descriptor().shape;
    if shape.len() < 2 || shape[0] != 1 || shape[2..].iter().any(|&d| d != 1) {
        return Err(PostError::invalid_model(format!(
            "classifier output shape {:?} is not 1 x C",
            shape
        )));
    }
    let dequant = view.descriptor().quantization.single()?.dequant_factor();

    let mut index = vec![0; shape.len()];
    let mut results = Vec::new();
    results.try_reserve_exact(shape[1])?;
    for ch in 0..shape[1] {
        index[1] = ch;
        results.push(ClassScore {
            class: ch as i32,
            score: view.get_raw(&index)? * dequant,
        });
    }

    // 最大値を引いてから指数をとる
    let max = results
        .iter()
        .map(|r| r.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = results.iter().map(|r| (r.score - max).exp()).sum();
    let offset = max as f64 + (sum as f64).ln();
    for r in results.iter_mut() {
        r.score = (r.score as f64 - offset).exp() as f32;
    }
    results.sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(ClassifierTopN {
        top_n_num: shape[1] as u32,
        results,
    })
}
