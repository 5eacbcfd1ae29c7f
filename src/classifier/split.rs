use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

fn group_by_label(labels: &[usize], rng: &mut StdRng) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(i);
    }
    for group in groups.values_mut() {
        group.shuffle(rng);
    }
    groups
}

/// 按标签分层划分训练集与测试集，返回 `(训练集下标, 测试集下标)`
///
/// 每个类别至少保留一个样本在训练集中，只有一个样本的类别不会进入测试集。
pub fn stratified_split(
    labels: &[usize],
    test_ratio: f64,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<usize>) {
    let (mut train, mut test) = (vec![], vec![]);
    for group in group_by_label(labels, rng).into_values() {
        let n = group.len();
        let n_test = ((n as f64 * test_ratio).round() as usize).min(n - 1);
        test.extend_from_slice(&group[..n_test]);
        train.extend_from_slice(&group[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// 分层 k 折划分，返回每一折作为验证集的下标
pub fn stratified_folds(labels: &[usize], k: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    assert!(k > 0, "折数必须大于 0");
    let mut folds = vec![vec![]; k];
    // 每个类别从不同的折开始轮转分配，使各折大小尽量均衡
    let mut offset = 0;
    for group in group_by_label(labels, rng).into_values() {
        for (j, i) in group.into_iter().enumerate() {
            folds[(offset + j) % k].push(i);
        }
        offset += 1;
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

/// 每个类别的样本数量，长度为 `n_classes`
pub fn class_counts(labels: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0; n_classes];
    for &label in labels {
        counts[label] += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn split_is_stratified() {
        let labels = [vec![0; 20], vec![1; 10], vec![2; 1]].concat();
        let mut rng = StdRng::seed_from_u64(42);
        let (train, test) = stratified_split(&labels, 0.2, &mut rng);

        assert_eq!(train.len() + test.len(), labels.len());
        let test_labels = test.iter().map(|&i| labels[i]).collect::<Vec<_>>();
        assert_eq!(class_counts(&test_labels, 3), vec![4, 2, 0]);
        // 单样本类别留在训练集
        assert!(train.iter().any(|&i| labels[i] == 2));
    }

    #[test]
    fn folds_cover_every_sample_once() {
        let labels = [vec![0; 7], vec![1; 3]].concat();
        let mut rng = StdRng::seed_from_u64(1);
        let folds = stratified_folds(&labels, 3, &mut rng);

        let mut all = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        for fold in &folds {
            // 每个类别在每一折中都至少出现一次
            assert!(fold.iter().any(|&i| labels[i] == 0));
            assert!(fold.iter().any(|&i| labels[i] == 1));
        }
    }
}
