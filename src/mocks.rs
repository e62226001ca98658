use crate::errors::{EnsembleError, Result};
use crate::traits::{ModelProvider, ReplicaPredictor};
use ndarray::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// テスト用の定数出力モデル
///
/// 全ピクセル・全クラスに同じ値、または指定クラスのみ 1.0 を返す
#[derive(Debug, Clone)]
pub struct ConstantPredictor {
    values: Vec<f32>,
}

impl ConstantPredictor {
    pub fn new(value: f32, n_classes: usize) -> Self {
        Self {
            values: vec![value; n_classes],
        }
    }

    /// `hot` がクラス数以上のときは全クラス 0.0 になる
    pub fn one_hot(n_classes: usize, hot: usize) -> Self {
        let mut values = vec![0.0; n_classes];
        if let Some(v) = values.get_mut(hot) {
            *v = 1.0;
        }
        Self { values }
    }
}

impl ReplicaPredictor for ConstantPredictor {
    fn predict_on_batch(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (b, h, w, _) = batch.dim();
        Ok(Array4::from_shape_fn((b, h, w, self.values.len()), |(_, _, _, c)| {
            self.values[c]
        }))
    }

    fn n_classes(&self) -> usize {
        self.values.len()
    }
}

/// 入力チャンネルを定数倍してそのままクラス確率として返すモデル
///
/// 入力チャンネル数 == クラス数 のとき、パッチ切り出しから再構成までの
/// 往復で元ラスタ（の定数倍）が得られる。生存インスタンス数を共有カウンタで
/// 追跡するので、レプリカ間で推論器が解放されているか検証できる
#[derive(Debug)]
pub struct ScaledPredictor {
    scale: f32,
    n_classes: usize,
    live: Arc<AtomicUsize>,
}

impl ScaledPredictor {
    pub fn new(scale: f32, n_classes: usize) -> Self {
        Self::tracked(scale, n_classes, Arc::new(AtomicUsize::new(0)))
    }

    fn tracked(scale: f32, n_classes: usize, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            scale,
            n_classes,
            live,
        }
    }
}

impl Drop for ScaledPredictor {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ReplicaPredictor for ScaledPredictor {
    fn predict_on_batch(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        let channels = batch.dim().3;
        if channels != self.n_classes {
            return Err(EnsembleError::shape_mismatch(
                "scaled predictor input channels",
                self.n_classes,
                channels,
            ));
        }
        Ok(batch.mapv(|v| v * self.scale))
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn describe(&self) -> String {
        format!("scaled predictor (x{})", self.scale)
    }
}

/// テスト用のモデルファクトリー
///
/// レプリカ `i` は `scales[i]` 倍の [`ScaledPredictor`] を返す。
/// `failing` に含まれるレプリカは読み込みに失敗する
#[derive(Debug)]
pub struct MockModelProvider {
    scales: Vec<f32>,
    n_classes: usize,
    failing: Vec<usize>,
    live: Arc<AtomicUsize>,
    peak_live: AtomicUsize,
    loaded: Mutex<Vec<usize>>,
}

impl MockModelProvider {
    pub fn new(scales: Vec<f32>, n_classes: usize) -> Self {
        Self {
            scales,
            n_classes,
            failing: Vec::new(),
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: AtomicUsize::new(0),
            loaded: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failing(mut self, model_idx: usize) -> Self {
        self.failing.push(model_idx);
        self
    }

    /// 現在生存している推論器の数
    pub fn live_predictors(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 同時に生存していた推論器の最大数
    pub fn peak_live_predictors(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    /// 読み込み要求の順序
    pub fn load_order(&self) -> Vec<usize> {
        self.loaded.lock().clone()
    }
}

impl ModelProvider for MockModelProvider {
    type Predictor = ScaledPredictor;

    fn load(&self, model_idx: usize) -> Result<ScaledPredictor> {
        self.loaded.lock().push(model_idx);
        if self.failing.contains(&model_idx) {
            return Err(EnsembleError::Model {
                operation: format!("loading mock replica {}", model_idx),
                source: "simulated load failure".into(),
            });
        }
        let scale = self.scales.get(model_idx).copied().unwrap_or(1.0);
        let predictor = ScaledPredictor::tracked(scale, self.n_classes, Arc::clone(&self.live));
        self.peak_live
            .fetch_max(self.live.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(predictor)
    }
}
