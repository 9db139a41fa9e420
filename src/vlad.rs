//! VLAD 全局描述符：将一张图片的局部描述符聚合为固定长度的向量

use ndarray::prelude::*;

use crate::feature::FeatureSet;
use crate::vocab::Vocabulary;

const EPS: f32 = 1e-7;

/// VLAD 向量长度
pub fn vlad_dim(vocab: &Vocabulary) -> usize {
    vocab.k() * vocab.dim()
}

pub fn encode(features: &FeatureSet, vocab: &Vocabulary) -> Array1<f32> {
    encode_descriptors(features.descriptors(), vocab)
}

/// 计算描述符集合的 VLAD 向量
///
/// 每个描述符累加到最近聚类中心的残差上，展平后做符号平方根归一化，最后 L2 归一化。
/// 空集合返回全零向量
pub fn encode_descriptors(descriptors: ArrayView2<f32>, vocab: &Vocabulary) -> Array1<f32> {
    if descriptors.nrows() == 0 {
        return Array1::zeros(vlad_dim(vocab));
    }
    let centers = vocab.centers();
    let mut residuals = Array2::<f32>::zeros(centers.raw_dim());

    let labels = vocab.assign(descriptors);
    for (des, &label) in descriptors.rows().into_iter().zip(&labels) {
        let mut slot = residuals.row_mut(label);
        slot += &des;
        slot -= &centers.row(label);
    }

    let mut v = Array1::from_iter(residuals.iter().copied());
    v.mapv_inplace(|x| x.signum() * x.abs().sqrt());
    let norm = v.dot(&v).sqrt();
    v /= norm + EPS;
    v
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;
    use crate::config::DESCRIPTOR_DIM;
    use crate::feature::Keypoint;

    fn vocab() -> Vocabulary {
        let centers = Array::from_shape_fn((4, DESCRIPTOR_DIM), |(i, j)| if j == i { 10. } else { 0. });
        Vocabulary::from_centers(centers).unwrap()
    }

    fn features(rows: Array2<f32>) -> FeatureSet {
        let keypoints = (0..rows.nrows())
            .map(|i| Keypoint {
                x: i as f32,
                y: 0.,
                size: 1.,
                angle: 0.,
                response: 0.,
                octave: 0,
                class_id: -1,
            })
            .collect();
        FeatureSet::new(keypoints, rows).unwrap()
    }

    #[test]
    fn test_empty_set_is_zero_vector() {
        let v = encode_descriptors(Array2::zeros((0, DESCRIPTOR_DIM)).view(), &vocab());
        assert_eq!(v.len(), 4 * DESCRIPTOR_DIM);
        assert!(v.iter().all(|&x| x == 0.));
    }

    #[test]
    fn test_encoding_is_unit_length() {
        let rows = Array::from_shape_fn((30, DESCRIPTOR_DIM), |(i, j)| ((i * 7 + j * 3) % 11) as f32);
        let v = encode(&features(rows), &vocab());
        assert_eq!(v.len(), vlad_dim(&vocab()));
        assert!((v.dot(&v).sqrt() - 1.).abs() < 1e-4);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let rows = Array::from_shape_fn((30, DESCRIPTOR_DIM), |(i, j)| ((i + j) % 5) as f32);
        let a = encode(&features(rows.clone()), &vocab());
        let b = encode(&features(rows), &vocab());
        assert_eq!(a, b);
    }

    #[test]
    fn test_residuals_land_in_assigned_slot() {
        // 只有一个描述符，落在第 2 个中心附近，其余槽位必须为零
        let mut rows = Array2::zeros((1, DESCRIPTOR_DIM));
        rows[[0, 2]] = 9.;
        rows[[0, 100]] = 1.;
        let v = encode(&features(rows), &vocab());
        for (slot, chunk) in v.exact_chunks(DESCRIPTOR_DIM).into_iter().enumerate() {
            let energy = chunk.dot(&chunk);
            if slot == 2 {
                assert!((energy - 1.).abs() < 1e-4);
            } else {
                assert_eq!(energy, 0.);
            }
        }
    }

    #[test]
    fn test_signed_square_root() {
        let mut rows = Array2::zeros((1, DESCRIPTOR_DIM));
        rows[[0, 0]] = 14.;
        rows[[0, 1]] = -4.;
        let v = encode(&features(rows), &vocab());
        // 残差为 (4, -4)，平方根后为 (2, -2)，归一化后各为 ±1/sqrt(2)
        let expected = 1. / 2f32.sqrt();
        assert!((v[0] - expected).abs() < 1e-4);
        assert!((v[1] + expected).abs() < 1e-4);
    }
}
