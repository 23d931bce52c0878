//! Number helpers for table sizing.

const SMALL_PRIMES: [usize; 17] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59,
];

/// Trial division, short-circuited for the small primes.
pub fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if SMALL_PRIMES.binary_search(&n).is_ok() {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut divisor = 3;
    while divisor <= n / divisor {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

/// Smallest prime that is `>= n`.
pub fn next_prime(n: usize) -> usize {
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}
