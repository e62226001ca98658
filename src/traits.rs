use crate::errors::Result;
use ndarray::prelude::*;
use std::path::PathBuf;

/// パッチ列を受け取りクラス確率を返す推論器の抽象化
///
/// 依存関係逆転原則（DIP）に従い、再構成・アンサンブル側は
/// ONNX Runtime などの具象実装ではなくこの trait に依存する。
/// 契約は次の 2 点のみ:
/// - 入力バッチと同じ順序で、入力 1 パッチにつき 1 出力を返す
/// - 出力形状は `(B, P, P, n_classes)` で一定
pub trait ReplicaPredictor: Send + Sync {
    /// `(B, P, P, C_in)` の NHWC バッチを推論
    fn predict_on_batch(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>>;

    /// 出力のクラス数
    fn n_classes(&self) -> usize;

    /// 診断ログ用のモデル説明
    fn describe(&self) -> String {
        format!("predictor with {} classes", self.n_classes())
    }
}

/// レプリカ番号から学習済み推論器を読み込むファクトリー
///
/// 戻り値の推論器は呼び出し側が所有し、スコープを抜けた時点で
/// デバイスメモリ等の資源を解放する
pub trait ModelProvider: Send + Sync {
    type Predictor: ReplicaPredictor;

    fn load(&self, model_idx: usize) -> Result<Self::Predictor>;
}

/// 1 レプリカ分の「読み込み → 評価 → 推論 → 再構成 → 保存」を実行する単位
///
/// 実装は同期的に完了まで待つこと。オーケストレーターはこの戻りを
/// 次のレプリカ開始と集約開始のバリアとして扱う
pub trait ReplicaRunner {
    /// 成功時は保存した成果物のパスを返す
    fn run_replica(&self, model_idx: usize) -> Result<PathBuf>;
}

impl<T: ReplicaRunner + ?Sized> ReplicaRunner for &T {
    fn run_replica(&self, model_idx: usize) -> Result<PathBuf> {
        (**self).run_replica(model_idx)
    }
}
